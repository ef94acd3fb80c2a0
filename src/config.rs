use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::retrieval::EngineOptions;

/// Default encoder model family
const DEFAULT_MODEL: &str = "clip-vit-b-32";
/// Default similarity floor for same-modality text search
const DEFAULT_TEXT_MIN_SCORE: f32 = 0.3;
/// Default similarity floor for cross-modal image search
const DEFAULT_IMAGE_MIN_SCORE: f32 = 0.2;
const DEFAULT_TEXT_WEIGHT: f32 = 0.6;
const DEFAULT_IMAGE_WEIGHT: f32 = 0.4;
/// Default character budget for assembled text context
const DEFAULT_MAX_CONTEXT_LENGTH: usize = 2000;
/// Default cap on images in an assembled context
const DEFAULT_MAX_CONTEXT_IMAGES: usize = 5;
const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

/// Configuration for the retrieval engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Encoder model family (e.g. "clip-vit-b-32")
    #[serde(default = "default_model")]
    pub model: String,

    /// Minimum similarity for text results [0.0, 1.0].
    ///
    /// Text-to-text scores run higher than text-to-image scores, so the two
    /// thresholds are tuned independently.
    #[serde(default = "default_text_min_score")]
    pub text_min_score: f32,

    /// Minimum similarity for image results [0.0, 1.0]
    #[serde(default = "default_image_min_score")]
    pub image_min_score: f32,

    /// Fusion weight applied to text similarity scores
    #[serde(default = "default_text_weight")]
    pub text_weight: f32,

    /// Fusion weight applied to image similarity scores
    #[serde(default = "default_image_weight")]
    pub image_weight: f32,

    /// Character budget for assembled text context
    #[serde(default = "default_max_context_length")]
    pub max_context_length: usize,

    /// Maximum images in an assembled context
    #[serde(default = "default_max_context_images")]
    pub max_context_images: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            text_min_score: DEFAULT_TEXT_MIN_SCORE,
            image_min_score: DEFAULT_IMAGE_MIN_SCORE,
            text_weight: DEFAULT_TEXT_WEIGHT,
            image_weight: DEFAULT_IMAGE_WEIGHT,
            max_context_length: DEFAULT_MAX_CONTEXT_LENGTH,
            max_context_images: DEFAULT_MAX_CONTEXT_IMAGES,
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_text_min_score() -> f32 {
    DEFAULT_TEXT_MIN_SCORE
}

fn default_image_min_score() -> f32 {
    DEFAULT_IMAGE_MIN_SCORE
}

fn default_text_weight() -> f32 {
    DEFAULT_TEXT_WEIGHT
}

fn default_image_weight() -> f32 {
    DEFAULT_IMAGE_WEIGHT
}

fn default_max_context_length() -> usize {
    DEFAULT_MAX_CONTEXT_LENGTH
}

fn default_max_context_images() -> usize {
    DEFAULT_MAX_CONTEXT_IMAGES
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Address the HTTP API binds to
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            retrieval: RetrievalConfig::default(),
        }
    }
}

impl Config {
    fn validate(&self) {
        let retrieval = &self.retrieval;

        if !(0.0..=1.0).contains(&retrieval.text_min_score) {
            panic!(
                "retrieval.text_min_score must be between 0.0 and 1.0, got {}",
                retrieval.text_min_score
            );
        }
        if !(0.0..=1.0).contains(&retrieval.image_min_score) {
            panic!(
                "retrieval.image_min_score must be between 0.0 and 1.0, got {}",
                retrieval.image_min_score
            );
        }

        if retrieval.text_weight < 0.0 || retrieval.image_weight < 0.0 {
            panic!(
                "retrieval weights must be non-negative, got text {} image {}",
                retrieval.text_weight, retrieval.image_weight
            );
        }

        if retrieval.max_context_length == 0 {
            panic!("retrieval.max_context_length must be greater than 0");
        }
    }

    /// Load the config file, writing a default one if it does not exist.
    pub fn load_with(path: &Path) -> Self {
        if !path.exists() {
            std::fs::write(path, serde_yml::to_string(&Self::default()).unwrap())
                .expect("failed to write default config");
        }

        let config_str = std::fs::read_to_string(path).expect("failed to read config file");
        let config: Self = serde_yml::from_str(&config_str).expect("config is malformed");

        config.validate();

        config
    }
}

impl From<&RetrievalConfig> for EngineOptions {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            text_min_score: config.text_min_score,
            image_min_score: config.image_min_score,
            text_weight: config.text_weight,
            image_weight: config.image_weight,
            max_context_length: config.max_context_length,
            max_context_images: config.max_context_images,
        }
    }
}
