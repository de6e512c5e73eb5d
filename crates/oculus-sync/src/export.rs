//! Training-feature export: a Parquet snapshot of complete warehouse listings
//! plus a manifest with checksums.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int32Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use oculus_storage::{TrainingRow, Warehouse};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `training_features.parquet` and `manifest.json` into `dir` and
/// return the manifest path.
pub async fn export_training_features(warehouse: &Warehouse, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let rows = warehouse
        .training_rows()
        .await
        .context("loading training rows")?;
    let features_path = dir.join("training_features.parquet");
    write_training_parquet(&features_path, &rows)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        generated_at: Utc::now(),
        files: vec![manifest_entry("training_features", dir, &features_path, rows.len())?],
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(rows = rows.len(), manifest = %manifest_path.display(), "training features exported");
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_training_parquet(path: &Path, rows: &[TrainingRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("make", DataType::Utf8, true),
        ArrowField::new("model", DataType::Utf8, false),
        ArrowField::new("fuel", DataType::Utf8, false),
        ArrowField::new("mileage_km", DataType::Int64, false),
        ArrowField::new("power_kw", DataType::Int64, false),
        ArrowField::new("year_model", DataType::Int32, false),
        ArrowField::new("price", DataType::Float64, false),
    ]));

    let makes = StringArray::from(rows.iter().map(|r| r.make.as_deref()).collect::<Vec<_>>());
    let models = StringArray::from(rows.iter().map(|r| Some(r.model.as_str())).collect::<Vec<_>>());
    let fuels = StringArray::from(rows.iter().map(|r| Some(r.fuel.as_str())).collect::<Vec<_>>());
    let mileage = Int64Array::from(rows.iter().map(|r| r.mileage_km).collect::<Vec<_>>());
    let power = Int64Array::from(rows.iter().map(|r| r.power_kw).collect::<Vec<_>>());
    let years = Int32Array::from(rows.iter().map(|r| r.year_model).collect::<Vec<_>>());
    let prices = Float64Array::from(rows.iter().map(|r| r.price).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(makes),
            Arc::new(models),
            Arc::new(fuels),
            Arc::new(mileage),
            Arc::new(power),
            Arc::new(years),
            Arc::new(prices),
        ],
    )
    .context("building training feature record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use oculus_core::LakeTable;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    #[tokio::test]
    async fn exports_reconciled_listings_with_checksummed_manifest() {
        let (dir, pipeline) = fixture_pipeline().await;
        ingest_fixtures(&pipeline).await;
        pipeline
            .reconciler(tokio::sync::watch::channel(false).1)
            .reconcile(LakeTable::Willhaben)
            .await
            .unwrap();

        let out = dir.path().join("features");
        let manifest_path = pipeline.export_features(&out).await.unwrap();
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        let entry = &manifest["files"][0];
        assert_eq!(entry["path"], "training_features.parquet");
        assert_eq!(entry["rows"], 3);

        let parquet_bytes = std::fs::read(out.join("training_features.parquet")).unwrap();
        assert_eq!(entry["bytes"], parquet_bytes.len() as u64);
        assert_eq!(entry["sha256"], hex::encode(Sha256::digest(&parquet_bytes)));

        let reader = ParquetRecordBatchReaderBuilder::try_new(
            File::open(out.join("training_features.parquet")).unwrap(),
        )
        .unwrap()
        .build()
        .unwrap();
        let total: usize = reader.map(|batch| batch.unwrap().num_rows()).sum();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn empty_warehouse_exports_an_empty_file() {
        let (dir, pipeline) = fixture_pipeline().await;
        let manifest_path = pipeline.export_features(dir.path().join("empty")).await.unwrap();
        let manifest: ParquetManifestFileList =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].rows, 0);
    }

    #[derive(serde::Deserialize)]
    struct ParquetManifestFileList {
        files: Vec<RowCount>,
    }

    #[derive(serde::Deserialize)]
    struct RowCount {
        rows: usize,
    }
}
