// 通用工具模块

pub mod format;

pub use format::{format_bytes, format_eta, format_speed};
