//! 日志门面
//!
//! 统一转发 rat_logger 宏，crate 内部一律通过
//! `crate::utils::logger::{debug, info, warn, error}` 使用。
//! 日志后端的初始化由宿主应用负责，本 crate 不做任何初始化。

pub use rat_logger::{debug, error, info, warn};
