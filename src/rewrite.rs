//! HTTP Rewriting Engine: classifies a connection as HTTP or not by peeking
//! its first bytes, and for HTTP connections parses and rewrites the
//! `User-Agent` header of each request before forwarding it upstream.
//!
//! The classification step is the Rust translation of the original tool's
//! `isHTTP` peek-and-prefix-match; the parsing step swaps Go's
//! `http.ReadRequest` for `httparse`, which requires the driving loop here
//! to own body-length bookkeeping (Content-Length / chunked) that Go's
//! standard library did for free.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::cache::DecisionCache;
use crate::config::FirewallKind;
use crate::firewall::FirewallHandle;
use crate::policy::MatchPolicy;
use crate::profile::ProfileHandle;
use crate::stats::Stats;

const HTTP_METHODS: [&str; 9] = [
    "GET", "POST", "HEAD", "PUT", "DELETE", "OPTIONS", "TRACE", "CONNECT", "PATCH",
];
const PEEK_LEN: usize = 7;
const MAX_HEAD_SIZE: usize = 64 * 1024;
const NON_HTTP_BYPASS_TIMEOUT_SECS: u64 = 600;
const FIREWALL_WHITELIST_BYPASS_TIMEOUT_SECS: u64 = 86_400;

pub struct FlowContext {
    pub dest_ip: String,
    pub dest_port: u16,
    pub cache: std::sync::Arc<DecisionCache>,
    pub policy: std::sync::Arc<MatchPolicy>,
    pub stats: std::sync::Arc<Stats>,
    pub firewall: Option<FirewallHandle>,
    pub profile: Option<ProfileHandle>,
    pub fw_set_name: String,
    pub fw_kind: FirewallKind,
    pub buffer_size: usize,
}

impl FlowContext {
    fn endpoint(&self) -> (String, u16) {
        (self.dest_ip.clone(), self.dest_port)
    }

    async fn bypass(&self, timeout_secs: u64) {
        if let Some(fw) = &self.firewall {
            fw.add(
                self.dest_ip.clone(),
                self.dest_port,
                self.fw_set_name.clone(),
                self.fw_kind,
                timeout_secs,
            )
            .await;
        }
    }

    fn report_non_http(&self) {
        if let Some(profile) = &self.profile {
            profile.report_non_http(self.endpoint());
        }
    }

    fn report_http(&self) {
        if let Some(profile) = &self.profile {
            profile.report_http(self.endpoint());
        }
    }
}

fn is_http_prefix(peeked: &[u8]) -> bool {
    HTTP_METHODS.iter().any(|m| peeked.starts_with(m.as_bytes()))
}

/// Reads from `reader` into `buf` until at least `n` bytes are buffered or
/// the stream reaches EOF. Returns `false` when EOF was hit first.
async fn fill_at_least(reader: &mut OwnedReadHalf, buf: &mut BytesMut, n: usize) -> io::Result<bool> {
    while buf.len() < n {
        let read = reader.read_buf(buf).await?;
        if read == 0 {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Drives one flow's client-to-upstream direction to completion, then
/// half-closes the upstream writer regardless of how the loop ended.
pub async fn run(client: OwnedReadHalf, mut upstream: OwnedWriteHalf, ctx: FlowContext) -> io::Result<()> {
    let result = run_loop(client, &mut upstream, &ctx).await;
    let _ = upstream.shutdown().await;
    result
}

async fn run_loop(mut client: OwnedReadHalf, upstream: &mut OwnedWriteHalf, ctx: &FlowContext) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(ctx.buffer_size);

    loop {
        let have_prefix = fill_at_least(&mut client, &mut buf, PEEK_LEN).await?;
        if !have_prefix {
            // Closed before a full classification prefix arrived; whatever
            // was buffered still has to reach upstream byte-for-byte.
            flush_raw(upstream, &mut buf).await?;
            return Ok(());
        }

        if !is_http_prefix(&buf[..PEEK_LEN]) {
            log::debug!("[{}:{}] protocol switch, relaying verbatim", ctx.dest_ip, ctx.dest_port);
            flush_raw(upstream, &mut buf).await?;
            ctx.report_non_http();
            if ctx.firewall.is_some() && ctx.profile.is_none() {
                ctx.bypass(NON_HTTP_BYPASS_TIMEOUT_SECS).await;
            }
            tokio::io::copy(&mut client, upstream).await?;
            return Ok(());
        }

        match parse_and_forward_one(&mut client, upstream, &mut buf, ctx).await? {
            LoopOutcome::Continue => continue,
            LoopOutcome::Stop => return Ok(()),
        }
    }
}

enum LoopOutcome {
    Continue,
    Stop,
}

async fn flush_raw(upstream: &mut OwnedWriteHalf, buf: &mut BytesMut) -> io::Result<()> {
    if !buf.is_empty() {
        upstream.write_all(buf).await?;
        buf.clear();
    }
    upstream.flush().await
}

async fn parse_and_forward_one(
    client: &mut OwnedReadHalf,
    upstream: &mut OwnedWriteHalf,
    buf: &mut BytesMut,
    ctx: &FlowContext,
) -> io::Result<LoopOutcome> {
    let (head_len, ua_range, body_len) = loop {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => {
                let ua_range = req
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("user-agent"))
                    .map(|h| byte_range_within(buf, h.value));
                let body_len = parse_body_length(req.headers);
                break (len, ua_range, body_len);
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() >= MAX_HEAD_SIZE {
                    log::debug!("[{}:{}] request head exceeded size limit", ctx.dest_ip, ctx.dest_port);
                    return Ok(LoopOutcome::Stop);
                }
                let read = client.read_buf(buf).await?;
                if read == 0 {
                    flush_raw(upstream, buf).await?;
                    return Ok(LoopOutcome::Stop);
                }
            }
            Err(err) => {
                log::debug!("[{}:{}] http parse error: {err}", ctx.dest_ip, ctx.dest_port);
                return Ok(LoopOutcome::Stop);
            }
        }
    };

    ctx.stats.inc_http_requests();
    ctx.report_http();

    let mut head = buf.split_to(head_len);

    if let Some((start, end)) = ua_range {
        let ua = String::from_utf8_lossy(&head[start..end]).into_owned();
        match decide_replacement(ctx, &ua) {
            ReplacementOutcome::Abort => {
                log::debug!(
                    "[{}:{}] firewall-allowlisted UA, dropping connection to force re-handshake",
                    ctx.dest_ip,
                    ctx.dest_port
                );
                return Ok(LoopOutcome::Stop);
            }
            ReplacementOutcome::Keep => {}
            ReplacementOutcome::Replace(final_ua) => {
                if final_ua != ua {
                    ctx.stats.inc_modified();
                }
                splice_header_value(&mut head, start, end, &final_ua);
            }
        }
    }

    upstream.write_all(&head).await?;
    upstream.flush().await?;

    forward_body(client, upstream, buf, body_len).await?;

    Ok(LoopOutcome::Continue)
}

enum BodyLength {
    Chunked,
    ContentLength(usize),
}

/// Reads the body-framing headers directly out of the already-parsed
/// `httparse::Header` slice, rather than re-scanning the head bytes.
fn parse_body_length(headers: &[httparse::Header]) -> BodyLength {
    let chunked = headers.iter().any(|h| {
        h.name.eq_ignore_ascii_case("transfer-encoding") && h.value.eq_ignore_ascii_case(b"chunked")
    });
    if chunked {
        return BodyLength::Chunked;
    }

    let content_length = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    BodyLength::ContentLength(content_length)
}

enum ReplacementOutcome {
    Keep,
    Replace(String),
    Abort,
}

/// Resolves the final UA string for this request, consulting the cache
/// first and falling back to the Match Policy + UA Builder on a miss.
fn decide_replacement(ctx: &FlowContext, ua: &str) -> ReplacementOutcome {
    if ua.is_empty() {
        return ReplacementOutcome::Keep;
    }

    if let Some(cached) = ctx.cache.get(ua) {
        if cached != ua {
            ctx.stats.inc_cache_hit_modify();
        } else {
            ctx.stats.inc_cache_hit_pass();
        }
        return ReplacementOutcome::Replace(cached);
    }

    let decision = ctx.policy.decide(ua);

    if decision.firewall_hit {
        let ctx_clone_ip = ctx.dest_ip.clone();
        let ctx_clone_port = ctx.dest_port;
        let firewall = ctx.firewall.clone();
        let set_name = ctx.fw_set_name.clone();
        let kind = ctx.fw_kind;
        tokio::spawn(async move {
            if let Some(fw) = firewall {
                fw.add(ctx_clone_ip, ctx_clone_port, set_name, kind, FIREWALL_WHITELIST_BYPASS_TIMEOUT_SECS)
                    .await;
            }
        });
        // Firewall-whitelisted UAs are intentionally not cached so a
        // configuration change retakes effect immediately.
        return if ctx.policy.drop_on_fw_match {
            ReplacementOutcome::Abort
        } else {
            ReplacementOutcome::Keep
        };
    }

    let final_ua = if decision.replace {
        ctx.policy.build_ua(ua)
    } else {
        ua.to_string()
    };

    ctx.cache.put(ua.to_string(), final_ua.clone());
    ReplacementOutcome::Replace(final_ua)
}

fn byte_range_within(buf: &[u8], value: &[u8]) -> (usize, usize) {
    let base = buf.as_ptr() as usize;
    let start = value.as_ptr() as usize - base;
    (start, start + value.len())
}

fn splice_header_value(head: &mut BytesMut, start: usize, end: usize, replacement: &str) {
    let mut rebuilt = BytesMut::with_capacity(head.len() - (end - start) + replacement.len());
    rebuilt.extend_from_slice(&head[..start]);
    rebuilt.extend_from_slice(replacement.as_bytes());
    rebuilt.extend_from_slice(&head[end..]);
    *head = rebuilt;
}

async fn forward_body(
    client: &mut OwnedReadHalf,
    upstream: &mut OwnedWriteHalf,
    buf: &mut BytesMut,
    body_len: BodyLength,
) -> io::Result<()> {
    match body_len {
        BodyLength::Chunked => forward_chunked_body(client, upstream, buf).await,
        BodyLength::ContentLength(content_length) => forward_exact(client, upstream, buf, content_length).await,
    }
}

async fn forward_exact(
    client: &mut OwnedReadHalf,
    upstream: &mut OwnedWriteHalf,
    buf: &mut BytesMut,
    mut remaining: usize,
) -> io::Result<()> {
    while remaining > 0 {
        if buf.is_empty() {
            let read = client.read_buf(buf).await?;
            if read == 0 {
                return Ok(());
            }
        }
        let take = remaining.min(buf.len());
        let chunk = buf.split_to(take);
        upstream.write_all(&chunk).await?;
        remaining -= take;
    }
    upstream.flush().await
}

async fn forward_chunked_body(
    client: &mut OwnedReadHalf,
    upstream: &mut OwnedWriteHalf,
    buf: &mut BytesMut,
) -> io::Result<()> {
    loop {
        let size_line = read_line(client, buf).await?;
        let Some(size_line) = size_line else { return Ok(()) };
        upstream.write_all(size_line.as_bytes()).await?;
        upstream.write_all(b"\r\n").await?;

        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16).unwrap_or(0);

        if size == 0 {
            // Trailers, terminated by a blank line.
            loop {
                match read_line(client, buf).await? {
                    Some(line) if !line.is_empty() => {
                        upstream.write_all(line.as_bytes()).await?;
                        upstream.write_all(b"\r\n").await?;
                    }
                    _ => {
                        upstream.write_all(b"\r\n").await?;
                        break;
                    }
                }
            }
            return upstream.flush().await;
        }

        forward_exact(client, upstream, buf, size).await?;
        // Trailing CRLF after each chunk's data.
        let _ = read_line(client, buf).await?;
        upstream.write_all(b"\r\n").await?;
    }
}

/// Reads one CRLF-terminated line out of `buf`/`client`, without the
/// terminator. Returns `None` on EOF before any data was read.
async fn read_line(client: &mut OwnedReadHalf, buf: &mut BytesMut) -> io::Result<Option<String>> {
    loop {
        if let Some(pos) = find_crlf(buf) {
            let line = buf.split_to(pos);
            buf.advance_past_crlf();
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
        let read = client.read_buf(buf).await?;
        if read == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            let line = std::mem::take(buf);
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

trait AdvancePastCrlf {
    fn advance_past_crlf(&mut self);
}

impl AdvancePastCrlf for BytesMut {
    fn advance_past_crlf(&mut self) {
        if self.len() >= 2 && &self[..2] == b"\r\n" {
            let _ = self.split_to(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_methods() {
        for m in HTTP_METHODS {
            let mut line = m.as_bytes().to_vec();
            line.resize(PEEK_LEN, b' ');
            assert!(is_http_prefix(&line), "method {m} should classify as http");
        }
    }

    #[test]
    fn rejects_tls_client_hello_prefix() {
        let tls = [0x16, 0x03, 0x01, 0x00, 0xa5, 0x01, 0x00];
        assert!(!is_http_prefix(&tls));
    }

    #[test]
    fn rejects_short_prefix_from_unrelated_protocol() {
        let raw = b"\x00\x01\x02\x03\x04\x05\x06";
        assert!(!is_http_prefix(raw));
    }

    #[test]
    fn splice_header_value_replaces_only_target_bytes() {
        let mut head = BytesMut::from(&b"GET / HTTP/1.1\r\nUser-Agent: curl/8.0\r\n\r\n"[..]);
        let start = head.windows(4).position(|w| w == b"curl").unwrap();
        let end = start + "curl/8.0".len();
        splice_header_value(&mut head, start, end, "FFF");
        assert_eq!(&head[..], &b"GET / HTTP/1.1\r\nUser-Agent: FFF\r\n\r\n"[..]);
    }

    #[test]
    fn parse_body_length_reads_content_length_case_insensitively() {
        let headers = [httparse::Header { name: "Content-Length", value: b"42" }];
        assert!(matches!(parse_body_length(&headers), BodyLength::ContentLength(42)));
    }

    #[test]
    fn parse_body_length_prefers_chunked_transfer_encoding() {
        let headers = [
            httparse::Header { name: "Content-Length", value: b"42" },
            httparse::Header { name: "Transfer-Encoding", value: b"chunked" },
        ];
        assert!(matches!(parse_body_length(&headers), BodyLength::Chunked));
    }

    #[test]
    fn parse_body_length_defaults_to_zero_when_absent() {
        let headers: [httparse::Header; 0] = [];
        assert!(matches!(parse_body_length(&headers), BodyLength::ContentLength(0)));
    }

    fn ctx_with_policy(policy: MatchPolicy) -> FlowContext {
        FlowContext {
            dest_ip: "10.0.0.5".into(),
            dest_port: 80,
            cache: std::sync::Arc::new(DecisionCache::new(16)),
            policy: std::sync::Arc::new(policy),
            stats: Stats::new(),
            firewall: None,
            profile: None,
            fw_set_name: "bypass".into(),
            fw_kind: FirewallKind::Ipset,
            buffer_size: 8192,
        }
    }

    #[tokio::test]
    async fn firewall_allowlist_hit_without_drop_keeps_connection() {
        let policy = MatchPolicy {
            replacement_ua: "FFF".into(),
            mode: crate::policy::MatchMode::Keyword,
            regex: None,
            keywords: vec![],
            whitelist: vec![],
            fw_ua_whitelist: vec!["trusted".into()],
            partial_replace: false,
            drop_on_fw_match: false,
        };
        let ctx = ctx_with_policy(policy);
        assert!(matches!(decide_replacement(&ctx, "trusted-agent"), ReplacementOutcome::Keep));
    }

    #[tokio::test]
    async fn firewall_allowlist_hit_with_drop_aborts_connection() {
        let policy = MatchPolicy {
            replacement_ua: "FFF".into(),
            mode: crate::policy::MatchMode::Keyword,
            regex: None,
            keywords: vec![],
            whitelist: vec![],
            fw_ua_whitelist: vec!["trusted".into()],
            partial_replace: false,
            drop_on_fw_match: true,
        };
        let ctx = ctx_with_policy(policy);
        assert!(matches!(decide_replacement(&ctx, "trusted-agent"), ReplacementOutcome::Abort));
    }
}
