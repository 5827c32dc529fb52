// DataFusion integration
//
// The embedded analytical engine behind `embedded` sources, plus the Arrow
// conversions shared with parquet ingestion.

pub mod converter; // DataFusionResultConverter
pub mod session; // DataFusionSessionManager

pub use converter::DataFusionResultConverter;
pub use session::{DataFusionSessionManager, SessionConfig};
