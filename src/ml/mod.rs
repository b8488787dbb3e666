pub mod ml_model;
pub mod preprocess;
pub mod inference;
pub mod ranking;
pub mod loader;
pub mod lifecycle;
pub mod transient;

pub use ml_model::{BackboneConfig, CompileSettings, HeadConfig, RehomeClassifier, DEFAULT_TRUNCATE_LAYER, IMAGE_SIZE};
pub use preprocess::{decode_data_uri, CrossOriginPolicy, ImageFetcher, ImageInput, PreprocessedTensor, Preprocessor};
pub use inference::{InferenceEngine, RawDistribution};
pub use ranking::{rank, ReusabilityTable, FALLBACK_REUSABLE};
pub use loader::{BackboneSource, HeadOptions, LoaderSettings, ModelHandle, ModelLoader};
pub use lifecycle::{BatchOutcome, ClassificationRequest, ModelManager};
pub use transient::{TransientLease, TransientTracker};
