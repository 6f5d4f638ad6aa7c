pub mod blob_store;
pub mod fetcher;
pub mod inference;
pub mod model_loader;
pub mod pipeline;
pub mod preprocess;
pub mod result_store;
