use crate::AppState;
use crate::api::error::AppError;
use crate::models::ConversionRequest;
use crate::utils::validation::{content_disposition, validate_file_size};
use axum::{
    body::Body,
    extract::{Multipart, State, multipart::MultipartError},
    http::{StatusCode, header},
    response::{Html, Response},
};
use utoipa::ToSchema;

/// Multipart body accepted by `POST /convert` (documentation only)
#[derive(ToSchema)]
#[allow(dead_code)]
pub struct ConvertForm {
    /// Spreadsheet to convert (.xlsx, .xls or .ods)
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
    /// Target format: "ods" or "xlsx"
    #[schema(example = "xlsx")]
    pub format: String,
}

const UPLOAD_FORM: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Spreadsheet conversion</title>
</head>
<body>
  <h1>Convert a spreadsheet</h1>
  <form action="/convert" method="post" enctype="multipart/form-data">
    <p>
      <label for="file">File (.xlsx, .xls, .ods)</label>
      <input id="file" type="file" name="file" accept=".xlsx,.xls,.ods" required>
    </p>
    <p>
      <label for="format">Convert to</label>
      <select id="format" name="format">
        <option value="xlsx">XLSX</option>
        <option value="ods">ODS</option>
      </select>
    </p>
    <p><button type="submit">Convert</button></p>
  </form>
</body>
</html>
"#;

#[utoipa::path(
    get,
    path = "/convert",
    responses(
        (status = 200, description = "HTML upload form", body = String, content_type = "text/html")
    ),
    tag = "convert"
)]
pub async fn convert_form() -> Html<&'static str> {
    Html(UPLOAD_FORM)
}

fn multipart_error(e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge("Request body exceeds the maximum allowed limit".to_string())
    } else {
        AppError::BadRequest(e.body_text())
    }
}

#[utoipa::path(
    post,
    path = "/convert",
    request_body(content = ConvertForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Converted spreadsheet, sent as an attachment"),
        (status = 400, description = "Invalid upload or the converter produced no output", body = String, content_type = "text/plain"),
        (status = 413, description = "Upload too large", body = String, content_type = "text/plain"),
        (status = 504, description = "Converter timed out", body = String, content_type = "text/plain")
    ),
    tag = "convert"
)]
pub async fn convert(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut request = ConversionRequest::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();

        match name.as_str() {
            "file" => {
                request.filename = field.file_name().unwrap_or_default().to_string();
                let data = field.bytes().await.map_err(multipart_error)?;
                // The body limit leaves room for multipart framing, so check the file itself
                validate_file_size(data.len(), state.config.max_file_size)
                    .map_err(|e| AppError::PayloadTooLarge(e.message))?;
                request.content = Some(data);
            }
            "format" => {
                request.format = Some(field.text().await.map_err(multipart_error)?);
            }
            other => {
                tracing::debug!("Ignoring unexpected form field '{}'", other);
            }
        }
    }

    let converted = state.conversion.submit(request).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, converted.content_type)
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition(&converted.filename),
        )
        .body(Body::from(converted.data))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))
}
