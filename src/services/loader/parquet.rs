// Parquet ingestion through the Arrow reader bundled with DataFusion
use bytes::Bytes;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use crate::api::middleware::AppError;
use crate::models::Column;
use crate::services::datafusion::DataFusionResultConverter;

pub fn read_parquet(bytes: &[u8]) -> Result<Vec<Column>, AppError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::copy_from_slice(bytes))
        .map_err(|e| AppError::Parse(format!("Invalid parquet file: {}", e)))?;
    let schema = builder.schema().clone();
    let reader = builder
        .build()
        .map_err(|e| AppError::Parse(format!("Failed to read parquet file: {}", e)))?;

    let batches = reader
        .collect::<Result<Vec<RecordBatch>, _>>()
        .map_err(|e| AppError::Parse(format!("Failed to decode parquet batch: {}", e)))?;

    DataFusionResultConverter::batches_to_columns(&schema, &batches)
        .map_err(|e| AppError::Parse(e.to_string()))
}
