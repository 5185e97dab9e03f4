//! Alt-Svc 通告规则测试
//!
//! 覆盖担保/备选主机名一致与不一致两种权威计算、未发布时的
//! 优雅降级以及明文 HTTP 不参与通告的规则。

use rat_httpcore::server::{AltSvcRegistry, BoundService, ServiceKind};
use hyper::header::{HeaderMap, ALT_SVC};

fn bound(kind: ServiceKind, host: &str, addr: &str) -> BoundService {
    BoundService {
        kind,
        configured_host: host.to_string(),
        bound_addr: addr.parse().expect("测试地址非法"),
    }
}

#[test]
fn test_same_resolved_host_omits_authority_host() {
    let registry = AltSvcRegistry::new(true, 86400);
    let services = vec![
        bound(ServiceKind::Http, "localhost", "127.0.0.1:8080"),
        bound(ServiceKind::Https, "localhost", "127.0.0.1:8443"),
    ];
    registry.publish(&services);

    let adv = registry
        .advertisement(ServiceKind::Http)
        .expect("HTTP 担保应有通告");
    assert_eq!(adv, "h2=\":8443\"; ma=86400", "主机一致时只通告端口");
    // HTTPS 没有可通告的兄弟（明文 HTTP 不参与通告）
    assert!(registry.advertisement(ServiceKind::Https).is_none());
}

#[test]
fn test_differing_resolved_host_uses_configured_host() {
    let registry = AltSvcRegistry::new(true, 60);
    // 担保绑定到具体接口，备选绑定到通配地址 → 解析主机不一致
    let services = vec![
        bound(ServiceKind::Https, "localhost", "127.0.0.1:8443"),
        bound(ServiceKind::Http3, "localhost", "0.0.0.0:9443"),
    ];
    registry.publish(&services);

    let adv = registry
        .advertisement(ServiceKind::Https)
        .expect("HTTPS 担保应有通告");
    assert_eq!(
        adv, "h3=\"localhost:9443\"; ma=60",
        "主机不一致时回退配置主机名，不泄露通配地址"
    );
}

#[test]
fn test_h3_listed_before_h2() {
    let registry = AltSvcRegistry::new(true, 86400);
    let services = vec![
        bound(ServiceKind::Http, "localhost", "127.0.0.1:8080"),
        bound(ServiceKind::Https, "localhost", "127.0.0.1:8443"),
        bound(ServiceKind::Http3, "localhost", "127.0.0.1:9443"),
    ];
    registry.publish(&services);

    let adv = registry
        .advertisement(ServiceKind::Http)
        .expect("HTTP 担保应有通告");
    assert_eq!(adv, "h3=\":9443\"; ma=86400, h2=\":8443\"; ma=86400");
}

#[test]
fn test_missing_sibling_advertises_nothing_for_it() {
    let registry = AltSvcRegistry::new(true, 86400);
    // HTTP/3 未绑定成功 → 完全缺席，不构成错误
    let services = vec![
        bound(ServiceKind::Http, "localhost", "127.0.0.1:8080"),
        bound(ServiceKind::Https, "localhost", "127.0.0.1:8443"),
    ];
    registry.publish(&services);

    let adv = registry
        .advertisement(ServiceKind::Http)
        .expect("HTTP 担保应有通告");
    assert!(!adv.contains("h3"), "未绑定的兄弟服务不得出现在通告里");
}

#[test]
fn test_unpublished_registry_degrades_gracefully() {
    let registry = AltSvcRegistry::new(true, 86400);
    let mut headers = HeaderMap::new();
    registry.decorate(ServiceKind::Http, &mut headers);
    assert!(
        !headers.contains_key(ALT_SVC),
        "表未发布时必须降级为不通告，而不是阻塞或报错"
    );
}

#[test]
fn test_disabled_registry_never_advertises() {
    let registry = AltSvcRegistry::new(false, 86400);
    let services = vec![
        bound(ServiceKind::Http, "localhost", "127.0.0.1:8080"),
        bound(ServiceKind::Https, "localhost", "127.0.0.1:8443"),
    ];
    registry.publish(&services);

    let mut headers = HeaderMap::new();
    registry.decorate(ServiceKind::Http, &mut headers);
    assert!(!headers.contains_key(ALT_SVC));
}

#[test]
fn test_decorate_injects_header() {
    let registry = AltSvcRegistry::new(true, 86400);
    let services = vec![
        bound(ServiceKind::Http, "localhost", "127.0.0.1:8080"),
        bound(ServiceKind::Http3, "localhost", "127.0.0.1:9443"),
    ];
    registry.publish(&services);

    let mut headers = HeaderMap::new();
    registry.decorate(ServiceKind::Http, &mut headers);
    assert_eq!(
        headers.get(ALT_SVC).and_then(|v| v.to_str().ok()),
        Some("h3=\":9443\"; ma=86400")
    );
}
