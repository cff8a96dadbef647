pub mod conversion;
pub mod converter;
pub mod workspace;
