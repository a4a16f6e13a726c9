//! Source-side stages: page enumeration, page fetching, and conversion of
//! items into action messages.

pub mod fetcher;
pub mod producers;
pub mod streamer;

pub use fetcher::PageFetcher;
pub use producers::{
    ActionMessageProducer, DeleteMessageProducer, KeyChangeMessageProducer, UpsertMessageProducer,
};
pub use streamer::{page_requests, PagedResourceStreamer, ResourceStreamRequest};
