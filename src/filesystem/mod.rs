// 文件系统模块

pub mod bookmark;
pub mod naming;

pub use bookmark::{AccessGuard, PortableResolver, Resolution, SecureLocationResolver};
