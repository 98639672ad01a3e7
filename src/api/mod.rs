// 上传服务 HTTP 接口

pub mod body;
pub mod client;

pub use client::{HttpTransport, UploadEndpoints};
