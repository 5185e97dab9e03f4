//! rustls 加密后端初始化
//!
//! 进程级只安装一次 ring 提供者；重复调用是无害的。

use std::sync::Once;

static CRYPTO_PROVIDER_INIT: Once = Once::new();

/// 确保 rustls 的 ring 加密提供者已安装
///
/// 这个函数使用 std::sync::Once 确保无论被调用多少次，
/// 提供者的安装只会执行一次。安装失败（宿主已装入其他提供者）
/// 不是错误，沿用进程内既有提供者即可。
pub fn ensure_crypto_provider_installed() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_ok()
        {
            crate::utils::logger::debug!("🔐 rustls ring 加密提供者已安装");
        } else {
            crate::utils::logger::debug!("🔐 进程内已存在 rustls 加密提供者，沿用现有配置");
        }
    });
}
