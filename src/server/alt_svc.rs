//! Alt-Svc 备选服务通告
//!
//! 所有监听器完成绑定后，为每个"担保"服务计算它应通告的兄弟
//! 协议端点（h2 / h3），解析各自的实际绑定地址并缓存整个服务
//! 生命周期。通告是尽力而为的特性：兄弟服务没绑定成功就不通告，
//! 通告表尚未发布时优雅降级为不注入任何头。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::OnceLock;

use hyper::header::{HeaderMap, HeaderValue, ALT_SVC};

use crate::utils::logger::{debug, info, warn};

/// 监听服务类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// 明文 TCP（HTTP/1.1 + h2c 升级）
    Http,
    /// TLS TCP（ALPN: h2 / http/1.1）
    Https,
    /// QUIC UDP（HTTP/3）
    Http3,
}

impl ServiceKind {
    /// 作为备选服务对外通告时使用的协议令牌；明文 HTTP 不参与通告
    pub fn alt_token(&self) -> Option<&'static str> {
        match self {
            ServiceKind::Http => None,
            ServiceKind::Https => Some("h2"),
            ServiceKind::Http3 => Some("h3"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Http => "http",
            ServiceKind::Https => "https",
            ServiceKind::Http3 => "h3",
        }
    }
}

/// 一个完成绑定的监听服务
///
/// `configured_host` 是配置里的原始主机名（可能是 `localhost` 这类
/// 友好名字），`bound_addr` 是绑定后解析出的套接字地址（端口 0
/// 会在此处变成系统分配的实际端口）。
#[derive(Debug, Clone)]
pub struct BoundService {
    pub kind: ServiceKind,
    pub configured_host: String,
    pub bound_addr: SocketAddr,
}

/// 单条通告记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltRecord {
    pub token: &'static str,
    pub authority: String,
}

#[derive(Debug, Default)]
struct AltSvcTable {
    by_sponsor: HashMap<ServiceKind, HeaderValue>,
}

/// 通告注册表
///
/// 多服务绑定完成后发布一次（OnceLock 延迟），此前的查询一律
/// 降级为不通告而不是阻塞。
pub struct AltSvcRegistry {
    table: OnceLock<AltSvcTable>,
    max_age: u64,
    enabled: bool,
}

impl AltSvcRegistry {
    pub fn new(enabled: bool, max_age: u64) -> Self {
        Self {
            table: OnceLock::new(),
            max_age,
            enabled,
        }
    }

    /// 多服务绑定完成后发布通告表（只发布一次）
    ///
    /// `services` 只应包含绑定成功的服务；失败的兄弟服务直接缺席，
    /// 不构成错误。
    pub fn publish(&self, services: &[BoundService]) {
        if !self.enabled {
            debug!("📡 [Alt-Svc] 通告已禁用，跳过发布");
            return;
        }
        let mut table = AltSvcTable::default();
        for sponsor in services {
            let records = compute_records(sponsor, services);
            if records.is_empty() {
                continue;
            }
            let value = records
                .iter()
                .map(|r| format!("{}=\"{}\"; ma={}", r.token, r.authority, self.max_age))
                .collect::<Vec<_>>()
                .join(", ");
            match HeaderValue::from_str(&value) {
                Ok(header) => {
                    debug!(
                        "📡 [Alt-Svc] {} 服务通告: {}",
                        sponsor.kind.as_str(),
                        value
                    );
                    table.by_sponsor.insert(sponsor.kind, header);
                }
                Err(e) => warn!("⚠️ [Alt-Svc] 通告值不合法，跳过: {} ({})", value, e),
            }
        }
        if self.table.set(table).is_err() {
            warn!("⚠️ [Alt-Svc] 通告表重复发布，已忽略");
        } else {
            info!("📡 [Alt-Svc] 通告表已发布");
        }
    }

    /// 向响应头注入通告；表未就绪时不注入任何内容
    pub fn decorate(&self, sponsor: ServiceKind, headers: &mut HeaderMap) {
        let Some(table) = self.table.get() else {
            return;
        };
        if let Some(value) = table.by_sponsor.get(&sponsor) {
            headers.insert(ALT_SVC, value.clone());
        }
    }

    /// 查询某个担保服务的通告值（测试与诊断用）
    pub fn advertisement(&self, sponsor: ServiceKind) -> Option<String> {
        self.table
            .get()
            .and_then(|t| t.by_sponsor.get(&sponsor))
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }
}

/// 计算担保服务应通告的兄弟服务记录（h3 优先排列）
fn compute_records(sponsor: &BoundService, services: &[BoundService]) -> Vec<AltRecord> {
    let mut records = Vec::new();
    for alt in services {
        if alt.kind == sponsor.kind {
            continue;
        }
        let Some(token) = alt.kind.alt_token() else {
            continue;
        };
        records.push(AltRecord {
            token,
            authority: advertised_authority(sponsor, alt),
        });
    }
    records.sort_by_key(|r| match r.token {
        "h3" => 0,
        _ => 1,
    });
    records
}

/// 计算通告权威
///
/// 解析后的主机一致时省略主机、只给端口；不一致（例如一方绑定
/// 通配地址、另一方绑定具体接口）时回退到备选服务的配置主机名，
/// 避免把内部/通配地址泄露给按友好名字重连的客户端。
pub fn advertised_authority(sponsor: &BoundService, alt: &BoundService) -> String {
    if sponsor.bound_addr.ip() == alt.bound_addr.ip() {
        format!(":{}", alt.bound_addr.port())
    } else {
        format!("{}:{}", alt.configured_host, alt.bound_addr.port())
    }
}
