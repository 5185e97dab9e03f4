//! 上下文适配器
//!
//! 每个交换恰好一个适配流程：期望检查 → 调用处理器（恰好一次）→
//! 定稿并写出响应头 → 排水响应体 → 连接续用判定。
//!
//! 处理器可能在工作线程池上执行，但其完成结果在连接任务上被
//! `await` 回收，之后才触碰下沉/源与传输写出——不靠手工加锁。

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::StatusCode;

use crate::error::{RatError, RatResult};
use crate::server::alt_svc::{AltSvcRegistry, ServiceKind};
use crate::server::exchange::{HttpContext, ResponseHead};
use crate::utils::logger::warn;

/// 应用处理器：每个交换恰好调用一次
///
/// 完成前填充响应头；流式响应随时（完成前）向下沉附加生产者。
/// 返回错误时：响应头尚未写出则收到合成的 500 响应，
/// 已写出则连接被关闭（响应无法撤回）。
#[async_trait]
pub trait HttpHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: Arc<HttpContext>) -> RatResult<()>;
}

/// 处理器完成后的响应体计划
#[derive(Debug)]
pub(crate) enum BodyPlan {
    /// 无响应体
    Empty,
    /// 完整响应体一次写出
    Fixed(Bytes),
    /// 已附加生产者，进入拉式排水
    Streamed,
}

/// 调用处理器并定稿响应头
///
/// 成功时返回（已注入 Alt-Svc、补齐 Date/Server 的）响应头与
/// 响应体计划；失败向上传播，由各协议驱动转成合成 500 或关闭。
pub(crate) async fn invoke_handler(
    handler: &Arc<dyn HttpHandler>,
    ctx: &Arc<HttpContext>,
    alt_svc: &AltSvcRegistry,
    sponsor: ServiceKind,
) -> RatResult<(ResponseHead, BodyPlan)> {
    handler.handle(ctx.clone()).await?;

    let mut head = ctx.take_response_head();
    let plan = if ctx.sink().has_producer() {
        BodyPlan::Streamed
    } else if let Some(body) = ctx.take_fixed_body() {
        set_content_length(&mut head, body.len());
        BodyPlan::Fixed(body)
    } else {
        set_content_length(&mut head, 0);
        BodyPlan::Empty
    };

    // Alt-Svc 装饰紧贴响应头写出之前；表未就绪时不注入
    alt_svc.decorate(sponsor, &mut head.headers);
    head.stamp();
    Ok((head, plan))
}

fn set_content_length(head: &mut ResponseHead, len: usize) {
    if head.headers.contains_key(CONTENT_LENGTH) {
        return;
    }
    // 1xx/204/304 禁止携带 Content-Length
    if head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
        head.headers.insert(CONTENT_LENGTH, value);
    }
}

/// 合成 417 Expectation Failed 响应头
///
/// 期望判定失败属协议策略违规：响应后丢弃请求体，连接按类别
/// 允许续用。
pub(crate) fn expectation_failed_head() -> (ResponseHead, Bytes) {
    let body = Bytes::from_static(b"417 Expectation Failed");
    let mut head = ResponseHead::new(StatusCode::EXPECTATION_FAILED);
    head.headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    set_content_length(&mut head, body.len());
    head.stamp();
    (head, body)
}

/// 合成 500 响应头（处理器失败且响应头尚未写出）
pub(crate) fn internal_error_head(err: &RatError) -> (ResponseHead, Bytes) {
    warn!("⚠️ [上下文适配器] 处理器失败，合成 500 响应: {}", err);
    let body = Bytes::from_static(b"500 Internal Server Error");
    let mut head = ResponseHead::new(StatusCode::INTERNAL_SERVER_ERROR);
    head.headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    set_content_length(&mut head, body.len());
    head.stamp();
    (head, body)
}
