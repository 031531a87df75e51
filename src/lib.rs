pub mod config;
pub mod encoder;
pub mod errors;
pub mod explain;
pub mod ir;
pub mod loader;
pub mod optimizer;
pub mod pipeline;
pub mod quantizer;

pub use config::{Configuration, ModelFormat, QuantDtype, TargetPlatform};
pub use errors::{ConvertError, Result, Warning};
pub use ir::{Graph, OpKind};
pub use pipeline::{convert, Conversion, Explanation};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
