pub mod anthropic;
pub mod base;
pub mod configs;
pub mod google;
pub mod ollama;
pub mod openai;
pub mod registry;
pub mod sse;
pub mod stream;
pub mod utils;
pub mod vercel;
