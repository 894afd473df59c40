// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! HTTP channels: the streaming configuration feed on the management port
//! and user-issued view requests. Responses are parsed with httparse once
//! for the head, then framed by Content-Length, chunked encoding, or
//! connection close.

use crate::handle::{Channel, Client};
use crate::registry::Completion;
use crate::scheduler::{TimerId, TimerKind};
use crate::*;
use cluster::ConfigDocument;
use net::{Connector, Interest};
use session::{Buf, Session};
use std::borrow::Borrow;

/// Successive documents on the streaming feed are separated by four
/// newlines.
const FEED_SEPARATOR: &[u8] = b"\n\n\n\n";

const MAX_HEADERS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    fn verb(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

/// An HTTP request against a node's view (or management) port. The engine
/// does not interpret the path; query strings are the caller's business.
#[derive(Debug, Clone)]
pub struct ViewRequest {
    pub method: HttpMethod,
    pub path: String,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
    /// Target server index; the first node advertising a view endpoint when
    /// unset.
    pub node: Option<usize>,
}

impl ViewRequest {
    pub fn get(path: &str) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.to_string(),
            body: Vec::new(),
            headers: Vec::new(),
            node: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Identifies a cancellable in-flight HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpHandle(pub(crate) usize);

pub(crate) enum HttpPurpose {
    /// The bootstrap provider's streaming configuration feed.
    ConfigFeed {
        host: String,
        idle_timer: Option<TimerId>,
        documents_seen: usize,
    },
    /// A user view request.
    View {
        id: usize,
        cookie: Cookie,
        request: ViewRequest,
        redirects: u32,
        deadline_timer: Option<TimerId>,
    },
}

enum ParseState {
    Head,
    Body,
    Done,
}

enum Framing {
    Length(usize),
    Chunked(ChunkState),
    Eof,
}

enum ChunkState {
    Size,
    Data(usize),
    DataCrlf,
    Last,
}

pub(crate) struct HttpChannel {
    session: Session,
    pub purpose: HttpPurpose,
    authority: String,
    state: ParseState,
    framing: Framing,
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    established: bool,
}

impl HttpChannel {
    /// Dial `authority` and buffer the request; it flushes once the socket
    /// is writable.
    fn open(
        authority: &str,
        purpose: HttpPurpose,
        method: HttpMethod,
        path: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<Self> {
        let stream = Connector::new()
            .connect(authority)
            .map_err(Error::ConnectFailed)?;

        let mut session = Session::from(stream);

        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: cbclient/0.1\r\nAccept: application/json\r\n",
            method.verb(),
            path,
            authority
        );
        if !body.is_empty() {
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        for (name, value) in headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");

        use session::BufMut;
        session.put_slice(head.as_bytes());
        session.put_slice(body);

        Ok(Self {
            session,
            purpose,
            authority: authority.to_string(),
            state: ParseState::Head,
            framing: Framing::Eof,
            status: 0,
            headers: Vec::new(),
            body: Vec::new(),
            established: false,
        })
    }

    pub fn interest(&self) -> Interest {
        if !self.established {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            self.session.interest()
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Parse the response head off the session buffer. Returns true once the
    /// head is complete.
    fn parse_head(&mut self) -> Result<bool> {
        let consumed;
        {
            let buffer: &[u8] = self.session.borrow();
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut response = httparse::Response::new(&mut headers);

            match response.parse(buffer) {
                Ok(httparse::Status::Complete(n)) => {
                    self.status = response.code.ok_or(Error::BadHttpResponse)?;
                    self.headers = response
                        .headers
                        .iter()
                        .map(|header| {
                            (
                                header.name.to_string(),
                                String::from_utf8_lossy(header.value).to_string(),
                            )
                        })
                        .collect();
                    consumed = n;
                }
                Ok(httparse::Status::Partial) => return Ok(false),
                Err(_) => return Err(Error::BadHttpResponse),
            }
        }

        self.session.consume(consumed);

        self.framing = if self
            .header("transfer-encoding")
            .map(|value| value.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
        {
            Framing::Chunked(ChunkState::Size)
        } else if let Some(length) = self.header("content-length") {
            Framing::Length(length.parse().map_err(|_| Error::BadHttpResponse)?)
        } else {
            Framing::Eof
        };

        self.state = ParseState::Body;
        Ok(true)
    }

    /// Move decoded body bytes out of the session buffer. Returns true when
    /// the framing says the response is complete.
    fn parse_body(&mut self) -> Result<bool> {
        loop {
            let available = self.session.remaining();
            if available == 0 {
                return Ok(matches!(self.framing, Framing::Length(0)));
            }

            match &mut self.framing {
                Framing::Length(remaining) => {
                    let take = std::cmp::min(available, *remaining);
                    {
                        let buffer: &[u8] = self.session.borrow();
                        self.body.extend_from_slice(&buffer[..take]);
                    }
                    self.session.consume(take);
                    *remaining -= take;
                    if *remaining == 0 {
                        self.state = ParseState::Done;
                        return Ok(true);
                    }
                }
                Framing::Eof => {
                    {
                        let buffer: &[u8] = self.session.borrow();
                        self.body.extend_from_slice(buffer);
                    }
                    self.session.consume(available);
                    // completion is the peer closing the stream
                    return Ok(false);
                }
                Framing::Chunked(chunk) => match chunk {
                    ChunkState::Size => {
                        let line_end = {
                            let buffer: &[u8] = self.session.borrow();
                            buffer.windows(2).position(|window| window == b"\r\n")
                        };
                        let line_end = match line_end {
                            Some(position) => position,
                            None => return Ok(false),
                        };
                        let size = {
                            let buffer: &[u8] = self.session.borrow();
                            let line = std::str::from_utf8(&buffer[..line_end])
                                .map_err(|_| Error::BadHttpResponse)?;
                            // chunk extensions after ';' are ignored
                            let digits = line.split(';').next().unwrap_or(line).trim();
                            usize::from_str_radix(digits, 16)
                                .map_err(|_| Error::BadHttpResponse)?
                        };
                        self.session.consume(line_end + 2);
                        *chunk = if size == 0 {
                            ChunkState::Last
                        } else {
                            ChunkState::Data(size)
                        };
                    }
                    ChunkState::Data(remaining) => {
                        let take = std::cmp::min(available, *remaining);
                        {
                            let buffer: &[u8] = self.session.borrow();
                            self.body.extend_from_slice(&buffer[..take]);
                        }
                        self.session.consume(take);
                        *remaining -= take;
                        if *remaining == 0 {
                            *chunk = ChunkState::DataCrlf;
                        }
                    }
                    ChunkState::DataCrlf => {
                        if self.session.remaining() < 2 {
                            return Ok(false);
                        }
                        self.session.consume(2);
                        *chunk = ChunkState::Size;
                    }
                    ChunkState::Last => {
                        // swallow the (usually empty) trailer up to its CRLF
                        if self.session.remaining() < 2 {
                            return Ok(false);
                        }
                        self.session.consume(2);
                        self.state = ParseState::Done;
                        return Ok(true);
                    }
                },
            }
        }
    }

    /// Pull finished documents off a streaming feed body.
    fn take_feed_documents(&mut self) -> Vec<String> {
        let mut documents = Vec::new();

        while let Some(position) = self
            .body
            .windows(FEED_SEPARATOR.len())
            .position(|window| window == FEED_SEPARATOR)
        {
            let mut document: Vec<u8> = self.body.drain(..position + FEED_SEPARATOR.len()).collect();
            document.truncate(position);
            if let Ok(text) = String::from_utf8(document) {
                let text = text.trim().to_string();
                if !text.is_empty() {
                    documents.push(text);
                }
            }
        }

        documents
    }
}

impl net::event::Source for HttpChannel {
    fn register(
        &mut self,
        registry: &net::Registry,
        token: net::Token,
        interest: Interest,
    ) -> std::io::Result<()> {
        self.session.register(registry, token, interest)
    }

    fn reregister(
        &mut self,
        registry: &net::Registry,
        token: net::Token,
        interest: Interest,
    ) -> std::io::Result<()> {
        self.session.reregister(registry, token, interest)
    }

    fn deregister(&mut self, registry: &net::Registry) -> std::io::Result<()> {
        self.session.deregister(registry)
    }
}

/// Authority and path of an absolute `http://` URL.
fn url_authority(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("http://")?;
    match rest.find('/') {
        Some(position) => Some((&rest[..position], &rest[position..])),
        None => Some((rest, "/")),
    }
}

impl Client {
    /// Open the streaming configuration feed against a management authority.
    pub(crate) fn open_config_feed(&mut self, authority: &str) -> Result<usize> {
        let host = authority
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| authority.to_string());
        let path = format!("/pools/default/bs/{}", self.settings.bucket());

        let channel = HttpChannel::open(
            authority,
            HttpPurpose::ConfigFeed {
                host,
                idle_timer: None,
                documents_seen: 0,
            },
            HttpMethod::Get,
            &path,
            &[],
            &[],
        )?;

        self.insert_http_channel(channel)
    }

    fn insert_http_channel(&mut self, channel: HttpChannel) -> Result<usize> {
        let entry = self.channels.vacant_entry();
        let token = entry.key();
        let channel = entry.insert(Channel::Http(channel));

        if let Channel::Http(channel) = channel {
            let interest = channel.interest();
            if let Err(e) = self.driver.register(channel, net::Token(token), interest) {
                error!("failed to register http channel: {}", e);
                self.channels.remove(token);
                return Err(Error::Driver(e));
            }
        }

        Ok(token)
    }

    /// Issue an HTTP request. The returned handle cancels it; cancellation
    /// guarantees the callback will not fire.
    pub fn http_request(&mut self, request: ViewRequest, cookie: Cookie) -> Result<HttpHandle> {
        if self.shutting_down {
            return Err(Error::Shutdown);
        }
        let map = self.map.clone().ok_or(Error::NotBootstrapped)?;

        let node = match request.node {
            Some(node) => node,
            None => map
                .endpoints()
                .iter()
                .position(|endpoint| endpoint.view_base().is_some())
                .unwrap_or(0),
        };
        let endpoint = map.server(node).ok_or(Error::NoServerForKey)?;

        let authority = endpoint
            .view_base()
            .and_then(url_authority)
            .map(|(authority, _)| authority.to_string())
            .unwrap_or_else(|| endpoint.mgmt_authority());

        let id = self.next_http_id;
        self.next_http_id += 1;

        let mut channel = HttpChannel::open(
            &authority,
            HttpPurpose::View {
                id,
                cookie,
                request: request.clone(),
                redirects: 0,
                deadline_timer: None,
            },
            request.method,
            &request.path,
            &request.headers,
            &request.body,
        )?;

        let now = self.clock.now();
        let deadline =
            self.timers
                .schedule_after(now, self.settings.view_timeout(), TimerKind::HttpDeadline { id });
        if let HttpPurpose::View { deadline_timer, .. } = &mut channel.purpose {
            *deadline_timer = Some(deadline);
        }

        let token = self.insert_http_channel(channel)?;
        self.http_exchanges.insert(id, token);
        Ok(HttpHandle(id))
    }

    /// Cancel an in-flight HTTP request. No callback fires for a cancelled
    /// request.
    pub fn http_cancel(&mut self, handle: HttpHandle) {
        let token = match self.http_exchanges.remove(&handle.0) {
            Some(token) => token,
            None => return,
        };

        if let Some(Channel::Http(channel)) = self.channels.get_mut(token) {
            if let HttpPurpose::View { deadline_timer, .. } = &mut channel.purpose {
                if let Some(timer) = deadline_timer.take() {
                    self.timers.cancel(timer);
                }
            }
        }
        self.drop_channel(token);
    }

    /// One readiness event for an HTTP channel.
    pub(crate) fn on_http_event(
        &mut self,
        token: usize,
        readable: bool,
        writable: bool,
        error: bool,
    ) {
        if error {
            self.fail_http_channel(token, Error::Network(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "socket error",
            )));
            return;
        }

        if writable {
            let result = {
                let channel = match self.channels.get_mut(token) {
                    Some(Channel::Http(channel)) => channel,
                    _ => return,
                };
                if !channel.established {
                    match channel.session.take_error() {
                        Ok(None) if channel.session.is_established() => {
                            channel.established = true;
                            Ok(())
                        }
                        Ok(Some(e)) | Err(e) => Err(e),
                        Ok(None) => Ok(()),
                    }
                } else {
                    Ok(())
                }
            };

            if let Err(e) = result {
                self.fail_http_channel(token, Error::ConnectFailed(e));
                return;
            }

            let flushed = match self.channels.get_mut(token) {
                Some(Channel::Http(channel)) if channel.established => {
                    match channel.session.flush() {
                        Ok(_) => Ok(()),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
                        Err(e) => Err(e),
                    }
                }
                _ => Ok(()),
            };

            if let Err(e) = flushed {
                self.fail_http_channel(token, Error::Network(e));
                return;
            }
        }

        if readable {
            let filled = {
                let channel = match self.channels.get_mut(token) {
                    Some(Channel::Http(channel)) => channel,
                    _ => return,
                };
                channel.session.fill()
            };

            match filled {
                Ok(0) => {
                    self.on_http_eof(token);
                    return;
                }
                Ok(_) => {
                    if self.advance_http(token) {
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    self.fail_http_channel(token, Error::Network(e));
                    return;
                }
            }
        }

        self.reassert_interest(token);
    }

    /// Run the response parser over freshly buffered bytes. Returns true if
    /// the channel was consumed (completed, failed, or redirected).
    fn advance_http(&mut self, token: usize) -> bool {
        let step = {
            let channel = match self.channels.get_mut(token) {
                Some(Channel::Http(channel)) => channel,
                _ => return true,
            };

            loop {
                match channel.state {
                    ParseState::Head => match channel.parse_head() {
                        Ok(true) => continue,
                        Ok(false) => break Ok(false),
                        Err(e) => break Err(e),
                    },
                    ParseState::Body => match channel.parse_body() {
                        Ok(done) => break Ok(done),
                        Err(e) => break Err(e),
                    },
                    ParseState::Done => break Ok(true),
                }
            }
        };

        match step {
            Ok(done) => self.on_http_progress(token, done),
            Err(e) => {
                self.fail_http_channel(token, e);
                true
            }
        }
    }

    /// Act on parser progress: feed documents are installed as they
    /// complete, view responses complete when framing says so.
    fn on_http_progress(&mut self, token: usize, done: bool) -> bool {
        let is_feed = matches!(
            self.channels.get(token),
            Some(Channel::Http(channel)) if matches!(channel.purpose, HttpPurpose::ConfigFeed { .. })
        );

        if is_feed {
            let (status, documents, host) = {
                let channel = match self.channels.get_mut(token) {
                    Some(Channel::Http(channel)) => channel,
                    _ => return true,
                };
                let host = match &channel.purpose {
                    HttpPurpose::ConfigFeed { host, .. } => host.clone(),
                    _ => unreachable!(),
                };
                (channel.status, channel.take_feed_documents(), host)
            };

            if status != 0 && status != 200 {
                debug!("config feed rejected with status {}", status);
                let missing_bucket = status == 404;
                self.drop_channel(token);
                if missing_bucket {
                    self.on_bootstrap_attempt_fatal(Error::BucketNotFound);
                } else {
                    self.on_bootstrap_attempt_failed();
                }
                return true;
            }

            for text in documents {
                let text = cluster::replace_host_placeholder(&text, &host);
                match ConfigDocument::parse(&text) {
                    Ok(document) => {
                        if let Some(Channel::Http(channel)) = self.channels.get_mut(token) {
                            if let HttpPurpose::ConfigFeed { documents_seen, .. } =
                                &mut channel.purpose
                            {
                                *documents_seen += 1;
                            }
                        }
                        self.install_config(&document);
                    }
                    Err(e) => debug!("skipping malformed feed document: {}", e),
                }
            }

            // the feed never "completes"; it is closed by the idle timer or
            // by the peer
            return false;
        }

        if !done {
            return false;
        }

        self.finish_view_exchange(token)
    }

    /// A complete view response is buffered: follow a redirect or complete
    /// the exchange.
    fn finish_view_exchange(&mut self, token: usize) -> bool {
        let (id, cookie, request, redirects, deadline_timer, status, headers, body, location, authority) = {
            let channel = match self.channels.get_mut(token) {
                Some(Channel::Http(channel)) => channel,
                _ => return true,
            };
            let location = channel.header("location").map(str::to_string);
            let authority = channel.authority.clone();
            match &mut channel.purpose {
                HttpPurpose::View {
                    id,
                    cookie,
                    request,
                    redirects,
                    deadline_timer,
                } => (
                    *id,
                    *cookie,
                    request.clone(),
                    *redirects,
                    deadline_timer.take(),
                    channel.status,
                    std::mem::take(&mut channel.headers),
                    std::mem::take(&mut channel.body),
                    location,
                    authority,
                ),
                _ => return true,
            }
        };

        let redirect = matches!(status, 301 | 302 | 303 | 307 | 308);
        if redirect {
            if let Some(location) = location {
                self.drop_channel(token);
                self.follow_redirect(id, cookie, request, redirects, location, authority, deadline_timer);
                return true;
            }
        }

        if let Some(timer) = deadline_timer {
            self.timers.cancel(timer);
        }
        self.drop_channel(token);
        self.http_exchanges.remove(&id);
        self.queued.push(Completion::Http {
            cookie,
            result: Ok(HttpResponse {
                status,
                headers,
                body,
            }),
        });
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn follow_redirect(
        &mut self,
        id: usize,
        cookie: Cookie,
        mut request: ViewRequest,
        redirects: u32,
        location: String,
        previous_authority: String,
        deadline_timer: Option<TimerId>,
    ) {
        if redirects >= self.settings.max_redirects() {
            if let Some(timer) = deadline_timer {
                self.timers.cancel(timer);
            }
            self.http_exchanges.remove(&id);
            self.queued.push(Completion::Http {
                cookie,
                result: Err(Error::TooManyRedirects),
            });
            return;
        }

        let (authority, path) = match url_authority(&location) {
            Some((authority, path)) => (authority.to_string(), path.to_string()),
            // relative redirect: same authority
            None => (previous_authority, location),
        };

        debug!("following redirect to {}{}", authority, path);
        request.path = path;

        let channel = HttpChannel::open(
            &authority,
            HttpPurpose::View {
                id,
                cookie,
                request: request.clone(),
                redirects: redirects + 1,
                deadline_timer,
            },
            request.method,
            &request.path,
            &request.headers,
            &request.body,
        );

        match channel {
            Ok(channel) => match self.insert_http_channel(channel) {
                Ok(token) => {
                    self.http_exchanges.insert(id, token);
                }
                Err(e) => {
                    if let Some(timer) = deadline_timer {
                        self.timers.cancel(timer);
                    }
                    self.http_exchanges.remove(&id);
                    self.queued.push(Completion::Http {
                        cookie,
                        result: Err(e),
                    });
                }
            },
            Err(e) => {
                if let Some(timer) = deadline_timer {
                    self.timers.cancel(timer);
                }
                self.http_exchanges.remove(&id);
                self.queued.push(Completion::Http {
                    cookie,
                    result: Err(e),
                });
            }
        }
    }

    /// EOF on an HTTP channel. For EOF-framed view responses this is
    /// completion; for the feed it just ends the stream.
    fn on_http_eof(&mut self, token: usize) {
        let (is_feed, eof_framed, got_head) = match self.channels.get(token) {
            Some(Channel::Http(channel)) => (
                matches!(channel.purpose, HttpPurpose::ConfigFeed { .. }),
                matches!(channel.framing, Framing::Eof),
                !matches!(channel.state, ParseState::Head),
            ),
            _ => return,
        };

        if is_feed {
            let (documents_seen, idle_timer) = match self.channels.get_mut(token) {
                Some(Channel::Http(channel)) => match &mut channel.purpose {
                    HttpPurpose::ConfigFeed {
                        documents_seen,
                        idle_timer,
                        ..
                    } => (*documents_seen, idle_timer.take()),
                    _ => (0, None),
                },
                _ => (0, None),
            };
            if let Some(timer) = idle_timer {
                self.timers.cancel(timer);
            }
            self.drop_channel(token);
            if documents_seen == 0 {
                self.on_bootstrap_attempt_failed();
            }
            return;
        }

        if eof_framed && got_head {
            self.finish_view_exchange(token);
        } else {
            self.fail_http_channel(token, Error::BadHttpResponse);
        }
    }

    /// Close the feed after its post-install idle window.
    pub(crate) fn hold_config_feed_open(&mut self, token: usize) {
        let now = self.clock.now();
        let timer = self.timers.schedule_after(
            now,
            self.settings.htconfig_idle_timeout(),
            TimerKind::HtconfigIdle { token },
        );

        if let Some(Channel::Http(channel)) = self.channels.get_mut(token) {
            if let HttpPurpose::ConfigFeed { idle_timer, .. } = &mut channel.purpose {
                if let Some(previous) = idle_timer.replace(timer) {
                    self.timers.cancel(previous);
                }
            }
        }
    }

    /// The idle window on the streaming feed elapsed.
    pub(crate) fn on_htconfig_idle(&mut self, token: usize) {
        trace!("closing idle config feed");
        self.drop_channel(token);
    }

    /// The view request deadline elapsed.
    pub(crate) fn on_http_deadline(&mut self, id: usize) {
        let token = match self.http_exchanges.remove(&id) {
            Some(token) => token,
            None => return,
        };

        let cookie = match self.channels.get(token) {
            Some(Channel::Http(channel)) => match &channel.purpose {
                HttpPurpose::View { cookie, .. } => Some(*cookie),
                _ => None,
            },
            _ => None,
        };

        self.drop_channel(token);
        if let Some(cookie) = cookie {
            self.queued.push(Completion::Http {
                cookie,
                result: Err(Error::TimedOut),
            });
        }
    }

    pub(crate) fn fail_http_channel(&mut self, token: usize, error: Error) {
        let purpose = match self.channels.get_mut(token) {
            Some(Channel::Http(channel)) => std::mem::replace(
                &mut channel.purpose,
                HttpPurpose::ConfigFeed {
                    host: String::new(),
                    idle_timer: None,
                    documents_seen: 0,
                },
            ),
            _ => return,
        };

        self.drop_channel(token);

        match purpose {
            HttpPurpose::ConfigFeed { idle_timer, .. } => {
                if let Some(timer) = idle_timer {
                    self.timers.cancel(timer);
                }
                self.on_bootstrap_attempt_failed();
            }
            HttpPurpose::View {
                id,
                cookie,
                deadline_timer,
                ..
            } => {
                if let Some(timer) = deadline_timer {
                    self.timers.cancel(timer);
                }
                self.http_exchanges.remove(&id);
                self.queued.push(Completion::Http {
                    cookie,
                    result: Err(error),
                });
            }
        }
    }
}
