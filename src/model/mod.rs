pub mod model_metadata;
pub mod model_storage;
pub mod inference_config;
pub mod config;

pub use model_metadata::ModelMetadata;
pub use model_storage::{save_model_package, read_model_package, load_model_package, load_metadata, print_metadata_info, ModelPackage};
pub use inference_config::InferenceConfig;
pub use config::{ClassifierConfig, DeviceType, ModelSettings, HeadSettings, PreprocessSettings, ResizeMode, RuntimeSettings, FetchSettings};
