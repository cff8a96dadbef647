use crate::config::ConverterConfig;
use crate::services::conversion::ConversionService;
use crate::services::converter::SofficeConverter;
use std::sync::Arc;
use tracing::info;

pub async fn setup_conversion(config: &ConverterConfig) -> Arc<ConversionService> {
    let converter = SofficeConverter::from_config(config);

    info!(
        "📄 Converter: {} (timeout: {}, isolated profile: {})",
        converter.program(),
        match config.timeout() {
            Some(limit) => format!("{}s", limit.as_secs()),
            None => "none".to_string(),
        },
        config.isolated_profile
    );

    let program = converter.program().to_string();
    let service = Arc::new(ConversionService::new(Arc::new(converter), config.clone()));

    // Check once so a missing installation shows up at startup rather than on the first upload.
    // The result also seeds the cache behind /health.
    if service.converter_available().await {
        info!("✅ Converter is available");
    } else {
        tracing::warn!(
            "⚠️  Converter '{}' is not runnable! Conversions will fail until it is installed.",
            program
        );
    }

    service
}
