/// SIP PUBLISH 事务 (RFC 3903)
///
/// 与 REGISTER 流程相同：构造请求、发送、处理一次 401/407 认证重发
use rsip::{prelude::*, Response, SipMessage, StatusCode};
use rsipstack::{
    dialog::authenticate::{handle_client_authenticate, Credential},
    transaction::{
        endpoint::EndpointInnerRef,
        key::{TransactionKey, TransactionRole},
        make_tag,
        transaction::Transaction,
    },
    transport::SipAddr,
};
use tracing::{debug, info};

use crate::error::{PublishError, PublishResult};
use crate::publication::{PublishRequest, PublishResponse};

pub const HEADER_EVENT: &str = "Event";
pub const HEADER_SIP_ETAG: &str = "SIP-ETag";
pub const HEADER_SIP_IF_MATCH: &str = "SIP-If-Match";

/// 一次 PUBLISH 事务
pub struct Publication {
    pub last_seq: u32,
    pub endpoint: EndpointInnerRef,
    pub credential: Option<Credential>,
    pub call_id: rsip::headers::CallId,
    /// 记录收发的 SIP 报文
    pub trace_sip: bool,
}

impl Publication {
    pub fn new(endpoint: EndpointInnerRef, credential: Option<Credential>) -> Self {
        let call_id = crate::utils::make_call_id(endpoint.option.callid_suffix.as_deref());
        Self {
            last_seq: 0,
            endpoint,
            credential,
            call_id,
            trace_sip: false,
        }
    }

    pub fn with_trace(mut self, trace_sip: bool) -> Self {
        self.trace_sip = trace_sip;
        self
    }

    /// 构造 PUBLISH 请求
    ///
    /// Request-URI、From、To 都是账户地址
    pub fn build_request(&mut self, publish: &PublishRequest) -> PublishResult<rsip::Request> {
        self.last_seq += 1;

        let aor: rsip::Uri = format!("sip:{}", publish.aor)
            .as_str()
            .try_into()
            .map_err(|e| PublishError::InvalidUri(format!("{}: {}", publish.aor, e)))?;

        let to = rsip::typed::To {
            display_name: None,
            uri: aor.clone(),
            params: vec![],
        };
        let from = rsip::typed::From {
            display_name: None,
            uri: aor.clone(),
            params: vec![],
        }
        .with_tag(make_tag());

        let via = self.endpoint.get_via(None, None)?;

        let mut request = self.endpoint.make_request(
            rsip::Method::Publish,
            aor,
            via,
            from,
            to,
            self.last_seq,
            None,
        );

        request.headers.unique_push(self.call_id.clone().into());
        request
            .headers
            .push(rsip::Header::Other(HEADER_EVENT.into(), publish.event.into()));
        request
            .headers
            .unique_push(rsip::headers::Expires::from(publish.expires).into());
        if let Some(etag) = &publish.if_match {
            request
                .headers
                .push(rsip::Header::Other(HEADER_SIP_IF_MATCH.into(), etag.clone()));
        }

        match &publish.body {
            Some(body) => {
                request
                    .headers
                    .push(rsip::headers::ContentType::from(publish.content_type.to_string()).into());
                request
                    .headers
                    .unique_push(rsip::headers::ContentLength::from(body.len() as u32).into());
                request.body = body.clone();
            }
            None => {
                request
                    .headers
                    .unique_push(rsip::headers::ContentLength::from(0u32).into());
            }
        }

        Ok(request)
    }

    /// 发送 PUBLISH，返回最终响应
    pub async fn publish(
        &mut self,
        publish: &PublishRequest,
        destination: SipAddr,
    ) -> PublishResult<Response> {
        let request = self.build_request(publish)?;
        if self.trace_sip {
            info!("SIP >>> {}\n{}", destination, request);
        }

        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint.clone(), None);
        tx.destination = Some(destination.clone());

        tx.send().await?;
        let mut auth_sent = false;

        while let Some(msg) = tx.receive().await {
            match msg {
                SipMessage::Response(resp) => {
                    if self.trace_sip {
                        info!("SIP <<< {}\n{}", destination, resp);
                    }
                    match resp.status_code {
                        StatusCode::Trying => continue,
                        StatusCode::ProxyAuthenticationRequired | StatusCode::Unauthorized => {
                            if auth_sent {
                                debug!("received {} response after auth sent", resp.status_code);
                                return Ok(resp);
                            }

                            if let Some(cred) = &self.credential {
                                self.last_seq += 1;
                                tx = handle_client_authenticate(self.last_seq, &tx, resp, cred).await?;
                                tx.destination = Some(destination.clone());
                                if self.trace_sip {
                                    info!("SIP >>> {}\n{}", destination, tx.original);
                                }
                                tx.send().await?;
                                auth_sent = true;
                                continue;
                            } else {
                                debug!("received {} response without credential", resp.status_code);
                                return Ok(resp);
                            }
                        }
                        _ if resp.status_code.code() < 200 => continue,
                        _ => {
                            debug!("publication done: {}", resp.status_code);
                            return Ok(resp);
                        }
                    }
                }
                _ => break,
            }
        }

        Err(PublishError::transport(format!(
            "publication transaction to {} terminated without final response",
            destination
        )))
    }
}

/// 从最终响应中提取状态码、SIP-ETag 和 Expires
pub fn parse_response(resp: &Response) -> PublishResponse {
    let code = resp.status_code.code();
    let mut response = PublishResponse::new(code, reason_phrase(&resp.status_code));

    for header in resp.headers.iter() {
        match header {
            rsip::Header::Other(name, value) if name.eq_ignore_ascii_case(HEADER_SIP_ETAG) => {
                response.etag = Some(value.trim().to_string());
            }
            rsip::Header::Expires(expires) => {
                response.expires = expires.value().trim().parse::<u32>().ok();
            }
            _ => {}
        }
    }
    response
}

/// "200 OK" -> "OK"
fn reason_phrase(status: &StatusCode) -> String {
    let text = status.to_string();
    let reason = text.trim_start_matches(|c: char| c.is_ascii_digit()).trim();
    if reason.is_empty() {
        text
    } else {
        reason.to_string()
    }
}
