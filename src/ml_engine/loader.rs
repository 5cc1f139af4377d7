//! Lazy model loading.
//!
//! Each model is read from disk on first use and cached for the life of the
//! process. A missing or malformed file is a configuration error: it is
//! returned to the caller and not retried on the next call.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::models::{AnomalyModel, AnomalyModelFile, ForecastModel, ForecastModelFile};
use crate::config::ModelsConfig;

/// A model file is missing, unreadable or invalid.
#[derive(Debug, Clone, thiserror::Error)]
#[error("model configuration error ({}): {reason}", path.display())]
pub struct ModelConfigError {
    pub path: PathBuf,
    pub reason: String,
}

impl ModelConfigError {
    fn new(path: &Path, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

type LoadResult<T> = Result<Arc<T>, ModelConfigError>;

pub struct ModelLoader {
    anomaly_path: PathBuf,
    forecast_path: PathBuf,
    anomaly: OnceCell<LoadResult<dyn AnomalyModel>>,
    forecast: OnceCell<LoadResult<dyn ForecastModel>>,
}

impl ModelLoader {
    pub fn from_config(config: &ModelsConfig) -> Self {
        Self {
            anomaly_path: config.anomaly_path(),
            forecast_path: config.forecast_path(),
            anomaly: OnceCell::new(),
            forecast: OnceCell::new(),
        }
    }

    /// Loader with models already in memory.
    pub fn preloaded(anomaly: Arc<dyn AnomalyModel>, forecast: Arc<dyn ForecastModel>) -> Self {
        Self {
            anomaly_path: PathBuf::new(),
            forecast_path: PathBuf::new(),
            anomaly: OnceCell::from(Ok(anomaly)),
            forecast: OnceCell::from(Ok(forecast)),
        }
    }

    pub async fn anomaly(&self) -> LoadResult<dyn AnomalyModel> {
        self.anomaly
            .get_or_init(|| load_anomaly(&self.anomaly_path))
            .await
            .clone()
    }

    pub async fn forecast(&self) -> LoadResult<dyn ForecastModel> {
        self.forecast
            .get_or_init(|| load_forecast(&self.forecast_path))
            .await
            .clone()
    }
}

async fn read_model_file(path: &Path) -> Result<String, ModelConfigError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ModelConfigError::new(path, format!("cannot read model file: {e}")))
}

async fn load_anomaly(path: &Path) -> LoadResult<dyn AnomalyModel> {
    let text = read_model_file(path).await?;
    let file: AnomalyModelFile = serde_json::from_str(&text)
        .map_err(|e| ModelConfigError::new(path, format!("malformed anomaly model: {e}")))?;
    let model: Arc<dyn AnomalyModel> = match file {
        AnomalyModelFile::Gaussian(model) => {
            model
                .validate()
                .map_err(|e| ModelConfigError::new(path, e.to_string()))?;
            Arc::new(model)
        }
    };
    tracing::info!(path = %path.display(), "Anomaly model loaded");
    Ok(model)
}

async fn load_forecast(path: &Path) -> LoadResult<dyn ForecastModel> {
    let text = read_model_file(path).await?;
    let file: ForecastModelFile = serde_json::from_str(&text)
        .map_err(|e| ModelConfigError::new(path, format!("malformed forecast model: {e}")))?;
    let model: Arc<dyn ForecastModel> = match file {
        ForecastModelFile::Linear(model) => {
            model
                .validate()
                .map_err(|e| ModelConfigError::new(path, e.to_string()))?;
            Arc::new(model)
        }
    };
    tracing::info!(path = %path.display(), "Forecast model loaded");
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml_engine::models::{GaussianAnomalyModel, LinearForecastModel};
    use tempfile::tempdir;

    fn config_for(dir: &Path) -> ModelsConfig {
        ModelsConfig {
            dir: dir.to_path_buf(),
            ..ModelsConfig::default()
        }
    }

    #[tokio::test]
    async fn test_missing_model_is_fatal_and_sticky() {
        let dir = tempdir().unwrap();
        let loader = ModelLoader::from_config(&config_for(dir.path()));
        let err = loader.anomaly().await.err().unwrap();
        assert!(err.path.ends_with("anomaly_model.json"));

        // creating the file afterwards does not make the loader retry
        let json = serde_json::to_string(&AnomalyModelFile::Gaussian(GaussianAnomalyModel::default())).unwrap();
        std::fs::write(dir.path().join("anomaly_model.json"), json).unwrap();
        assert!(loader.anomaly().await.is_err());
    }

    #[tokio::test]
    async fn test_loads_from_json_files() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("anomaly_model.json"),
            serde_json::to_string(&AnomalyModelFile::Gaussian(GaussianAnomalyModel::default())).unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("forecast_model.json"),
            serde_json::to_string(&ForecastModelFile::Linear(LinearForecastModel::default())).unwrap(),
        )
        .unwrap();

        let loader = ModelLoader::from_config(&config_for(dir.path()));
        let anomaly = loader.anomaly().await.unwrap();
        let again = loader.anomaly().await.unwrap();
        assert!(Arc::ptr_eq(&anomaly, &again));
        assert!(loader.forecast().await.is_ok());
    }
}
