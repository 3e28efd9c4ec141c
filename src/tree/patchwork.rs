// Copyright (c) 2025-2026 the kci contributors
// SPDX-License-Identifier: Apache-2.0

//! Patchwork XML-RPC client.
//!
//! Patchwork instances speak one of two dialects: the public API (version
//! `[1,3,0]` or plain `1`, calls carry no version argument) and a private
//! one that requires a magic version `1010` prepended to every call and
//! echoed as the first element of every reply. The dialect is selected by
//! the initial `pw_rpc_version` probe: a fault with code 1 complaining
//! about an index out of range marks the private dialect.

use crate::utils::error::KciError;
use quick_xml::escape::{escape, unescape};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::LazyLock;

static PATCH_URL_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^(.*)/patch/(\d+)/?$").expect("patch url regex is invalid")
});

const MAGIC_VERSION: i64 = 1010;

/// Split a patch URL into its instance base URL and patch id.
pub fn parse_patch_url(uri: &str) -> Result<(String, i64), KciError> {
    let caps = PATCH_URL_RE
        .captures(uri)
        .ok_or_else(|| KciError::parse(format!("Can't parse patchwork url: '{}'", uri)))?;
    let base = caps[1].to_string();
    let id = caps[2]
        .parse()
        .map_err(|_| KciError::parse(format!("Can't parse patchwork url: '{}'", uri)))?;
    Ok((base, id))
}

/// XML-RPC wire value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Str(String),
    Bool(bool),
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>),
    Nil,
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct(map) => map.get(name),
            _ => None,
        }
    }
}

fn encode_value(out: &mut String, value: &Value) {
    match value {
        Value::Int(v) => {
            let _ = write!(out, "<value><int>{}</int></value>", v);
        }
        Value::Str(v) => {
            let _ = write!(out, "<value><string>{}</string></value>", escape(v.as_str()));
        }
        Value::Bool(v) => {
            let _ = write!(out, "<value><boolean>{}</boolean></value>", i32::from(*v));
        }
        Value::Array(items) => {
            out.push_str("<value><array><data>");
            for item in items {
                encode_value(out, item);
            }
            out.push_str("</data></array></value>");
        }
        Value::Struct(map) => {
            out.push_str("<value><struct>");
            for (name, item) in map {
                let _ = write!(out, "<member><name>{}</name>", escape(name.as_str()));
                encode_value(out, item);
                out.push_str("</member>");
            }
            out.push_str("</struct></value>");
        }
        Value::Nil => out.push_str("<value><nil/></value>"),
    }
}

fn encode_call(method: &str, params: &[Value]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodCall><methodName>");
    out.push_str(&escape(method));
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param>");
        encode_value(&mut out, param);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

fn text_of(event: &quick_xml::events::BytesText<'_>) -> Result<String, KciError> {
    let raw = String::from_utf8_lossy(event.as_ref()).into_owned();
    let unescaped = unescape(&raw)
        .map_err(|e| KciError::parse(format!("Bad XML escape in RPC reply: {}", e)))?;
    Ok(unescaped.into_owned())
}

fn read_text(reader: &mut Reader<&[u8]>, tag: &str) -> Result<String, KciError> {
    let mut text = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => text.push_str(&text_of(&e)?),
            Ok(Event::CData(e)) => text.push_str(&String::from_utf8_lossy(e.as_ref())),
            Ok(Event::End(e)) if e.name().as_ref() == tag.as_bytes() => return Ok(text),
            Ok(Event::Eof) => return Err(KciError::parse("Truncated RPC reply")),
            Err(e) => return Err(KciError::parse(format!("Bad RPC reply: {}", e))),
            _ => {}
        }
    }
}

/// Parse the contents of a `<value>` element; the opening tag has already
/// been consumed.
fn parse_value(reader: &mut Reader<&[u8]>) -> Result<Value, KciError> {
    let mut text = String::new();
    let mut typed: Option<Value> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let inner = match e.name().as_ref() {
                    b"int" | b"i4" => {
                        let body = read_text(reader, std::str::from_utf8(e.name().as_ref()).unwrap_or("int"))?;
                        Value::Int(body.trim().parse().map_err(|_| {
                            KciError::parse(format!("Bad integer in RPC reply: '{}'", body.trim()))
                        })?)
                    }
                    b"string" => Value::Str(read_text(reader, "string")?),
                    b"boolean" => Value::Bool(read_text(reader, "boolean")?.trim() == "1"),
                    b"array" => parse_array(reader)?,
                    b"struct" => parse_struct(reader)?,
                    b"nil" => {
                        read_text(reader, "nil")?;
                        Value::Nil
                    }
                    other => {
                        return Err(KciError::parse(format!(
                            "Unsupported RPC value type <{}>",
                            String::from_utf8_lossy(other)
                        )));
                    }
                };
                typed = Some(inner);
            }
            Ok(Event::Empty(e)) => {
                typed = match e.name().as_ref() {
                    b"nil" => Some(Value::Nil),
                    b"string" => Some(Value::Str(String::new())),
                    _ => typed,
                };
            }
            Ok(Event::Text(e)) => text.push_str(&text_of(&e)?),
            Ok(Event::CData(e)) => text.push_str(&String::from_utf8_lossy(e.as_ref())),
            Ok(Event::End(e)) if e.name().as_ref() == b"value" => {
                // A bare <value>text</value> is a string.
                return Ok(typed.unwrap_or(Value::Str(text)));
            }
            Ok(Event::Eof) => return Err(KciError::parse("Truncated RPC reply")),
            Err(e) => return Err(KciError::parse(format!("Bad RPC reply: {}", e))),
            _ => {}
        }
    }
}

fn parse_array(reader: &mut Reader<&[u8]>) -> Result<Value, KciError> {
    let mut items = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"value" => {
                items.push(parse_value(reader)?);
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"array" => return Ok(Value::Array(items)),
            Ok(Event::Eof) => return Err(KciError::parse("Truncated RPC reply")),
            Err(e) => return Err(KciError::parse(format!("Bad RPC reply: {}", e))),
            _ => {}
        }
    }
}

fn parse_struct(reader: &mut Reader<&[u8]>) -> Result<Value, KciError> {
    let mut map = BTreeMap::new();
    let mut name: Option<String> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"name" => {
                name = Some(read_text(reader, "name")?);
            }
            Ok(Event::Start(e)) if e.name().as_ref() == b"value" => {
                let value = parse_value(reader)?;
                if let Some(name) = name.take() {
                    map.insert(name, value);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"struct" => return Ok(Value::Struct(map)),
            Ok(Event::Eof) => return Err(KciError::parse("Truncated RPC reply")),
            Err(e) => return Err(KciError::parse(format!("Bad RPC reply: {}", e))),
            _ => {}
        }
    }
}

/// Parse a methodResponse document into its payload value, surfacing faults
/// as `KciError::RpcFault`.
fn parse_response(xml: &str) -> Result<Value, KciError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut in_fault = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"fault" => in_fault = true,
                b"value" => {
                    let value = parse_value(&mut reader)?;
                    if in_fault {
                        let code = value
                            .field("faultCode")
                            .and_then(Value::as_i64)
                            .unwrap_or(-1);
                        let message = value
                            .field("faultString")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown fault")
                            .to_string();
                        return Err(KciError::RpcFault {
                            code: code as i32,
                            message,
                        });
                    }
                    return Ok(value);
                }
                _ => {}
            },
            Ok(Event::Eof) => return Err(KciError::parse("RPC reply carries no value")),
            Err(e) => return Err(KciError::parse(format!("Bad RPC reply: {}", e))),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Public,
    /// Private instances require the magic version prepended to every call
    /// and echoed in every reply.
    Versioned(i64),
}

#[derive(Debug)]
pub struct PatchworkClient {
    endpoint: String,
    http: reqwest::Client,
    dialect: Dialect,
}

impl PatchworkClient {
    /// Probe `{base_url}/xmlrpc/` and negotiate the dialect.
    pub async fn connect(base_url: &str) -> Result<Self, KciError> {
        let mut client = Self {
            endpoint: format!("{}/xmlrpc/", base_url.trim_end_matches('/')),
            http: reqwest::Client::new(),
            dialect: Dialect::Public,
        };

        match client.call_raw("pw_rpc_version", &[]).await {
            Ok(version) => {
                let known = version == Value::Array(vec![Value::Int(1), Value::Int(3), Value::Int(0)])
                    || version == Value::Int(1);
                if !known {
                    return Err(KciError::parse(format!(
                        "Unknown xmlrpc version {:?}",
                        version
                    )));
                }
            }
            Err(KciError::RpcFault { code: 1, message })
                if message.contains("index out of range") =>
            {
                client.dialect = Dialect::Versioned(MAGIC_VERSION);
                let version = client.call("pw_rpc_version", vec![]).await?;
                if version.as_i64().unwrap_or(0) < MAGIC_VERSION {
                    return Err(KciError::parse(format!(
                        "Unsupported xmlrpc version {:?}",
                        version
                    )));
                }
            }
            Err(KciError::RpcFault { message, .. }) => {
                return Err(KciError::parse(format!("Unknown xmlrpc fault: {}", message)));
            }
            Err(e) => return Err(e),
        }

        Ok(client)
    }

    async fn call_raw(&self, method: &str, params: &[Value]) -> Result<Value, KciError> {
        let body = encode_call(method, params);
        tracing::debug!("patchwork rpc: {} -> {}", method, self.endpoint);

        let response = self
            .http
            .post(&self.endpoint)
            .header("content-type", "text/xml")
            .body(body)
            .send()
            .await?
            .error_for_status()?;

        let text = response.text().await?;
        parse_response(&text)
    }

    /// Dispatch a call through the negotiated dialect.
    async fn call(&self, method: &str, mut params: Vec<Value>) -> Result<Value, KciError> {
        match self.dialect {
            Dialect::Public => self.call_raw(method, &params).await,
            Dialect::Versioned(version) => {
                params.insert(0, Value::Int(version));
                let reply = self.call_raw(method, &params).await?;
                match reply {
                    Value::Array(mut items) if items.len() == 2 => {
                        let got = items[0].as_i64().unwrap_or(-1);
                        if got != version {
                            return Err(KciError::RpcProtocolMismatch {
                                got,
                                expected: version,
                            });
                        }
                        Ok(items.remove(1))
                    }
                    other => Err(KciError::RpcProtocolMismatch {
                        got: other.as_i64().unwrap_or(-1),
                        expected: version,
                    }),
                }
            }
        }
    }

    /// Fetch patch metadata; the struct carries at least `name`.
    pub async fn patch_get(&self, patch_id: i64) -> Result<Value, KciError> {
        let info = self.call("patch_get", vec![Value::Int(patch_id)]).await?;
        match info {
            Value::Struct(ref map) if !map.is_empty() => Ok(info),
            _ => Err(KciError::parse(format!(
                "Failed to fetch patch info for patch {}",
                patch_id
            ))),
        }
    }

    /// Fetch the mail-format body of a patch.
    pub async fn patch_get_mbox(&self, patch_id: i64) -> Result<String, KciError> {
        let mbox = self.call("patch_get_mbox", vec![Value::Int(patch_id)]).await?;
        mbox.as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| KciError::parse(format!("Patch {} mbox is not a string", patch_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(inner: &str) -> String {
        format!(
            "<?xml version=\"1.0\"?><methodResponse><params><param>{}</param></params></methodResponse>",
            inner
        )
    }

    fn fault(code: i32, message: &str) -> String {
        format!(
            "<?xml version=\"1.0\"?><methodResponse><fault><value><struct>\
             <member><name>faultCode</name><value><int>{}</int></value></member>\
             <member><name>faultString</name><value><string>{}</string></value></member>\
             </struct></value></fault></methodResponse>",
            code, message
        )
    }

    #[test]
    fn test_parse_patch_url() {
        let (base, id) = parse_patch_url("https://patchwork.example.org/patch/42").expect("parse");
        assert_eq!(base, "https://patchwork.example.org");
        assert_eq!(id, 42);

        let (base, id) = parse_patch_url("https://pw.example.org/sub/patch/7/").expect("parse");
        assert_eq!(base, "https://pw.example.org/sub");
        assert_eq!(id, 7);

        assert!(parse_patch_url("https://pw.example.org/bundle/9").is_err());
    }

    #[test]
    fn test_encode_call_escapes_strings() {
        let body = encode_call("patch_get", &[Value::Str("<&>".to_string())]);
        assert!(body.contains("<methodName>patch_get</methodName>"));
        assert!(body.contains("<string>&lt;&amp;&gt;</string>"));
    }

    #[test]
    fn test_parse_response_scalar_and_array() {
        let value = parse_response(&response("<value><int>1</int></value>")).expect("parse");
        assert_eq!(value, Value::Int(1));

        let value = parse_response(&response(
            "<value><array><data><value><int>1</int></value><value><int>3</int></value>\
             <value><int>0</int></value></data></array></value>",
        ))
        .expect("parse");
        assert_eq!(
            value,
            Value::Array(vec![Value::Int(1), Value::Int(3), Value::Int(0)])
        );
    }

    #[test]
    fn test_parse_response_struct_and_entities() {
        let value = parse_response(&response(
            "<value><struct><member><name>name</name>\
             <value><string>net: fix &lt;skb&gt; leak, twice</string></value>\
             </member></struct></value>",
        ))
        .expect("parse");
        assert_eq!(
            value.field("name").and_then(Value::as_str),
            Some("net: fix <skb> leak, twice")
        );
    }

    #[test]
    fn test_parse_response_bare_value_is_string() {
        let value = parse_response(&response("<value>plain</value>")).expect("parse");
        assert_eq!(value, Value::Str("plain".to_string()));
    }

    #[test]
    fn test_parse_response_fault() {
        let err = parse_response(&fault(1, "list index out of range")).expect_err("fault");
        match err {
            KciError::RpcFault { code, message } => {
                assert_eq!(code, 1);
                assert!(message.contains("index out of range"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_public_dialect() {
        let mut server = mockito::Server::new_async().await;
        let _probe = server
            .mock("POST", "/xmlrpc/")
            .with_body(response(
                "<value><array><data><value><int>1</int></value><value><int>3</int></value>\
                 <value><int>0</int></value></data></array></value>",
            ))
            .create_async()
            .await;

        let client = PatchworkClient::connect(&server.url()).await.expect("connect");
        assert_eq!(client.dialect, Dialect::Public);
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_version() {
        let mut server = mockito::Server::new_async().await;
        let _probe = server
            .mock("POST", "/xmlrpc/")
            .with_body(response("<value><int>2</int></value>"))
            .create_async()
            .await;

        let err = PatchworkClient::connect(&server.url()).await.expect_err("version");
        assert!(err.to_string().contains("Unknown xmlrpc version"));
    }

    #[tokio::test]
    async fn test_connect_negotiates_versioned_dialect() {
        let mut server = mockito::Server::new_async().await;
        // Probe without the version argument faults; the re-probe carries
        // 1010 and gets a wrapped reply.
        let _probe = server
            .mock("POST", "/xmlrpc/")
            .match_body(mockito::Matcher::Regex("pw_rpc_version".to_string()))
            .with_body(fault(1, "list index out of range"))
            .create_async()
            .await;
        let _reprobe = server
            .mock("POST", "/xmlrpc/")
            .match_body(mockito::Matcher::Regex("1010".to_string()))
            .with_body(response(
                "<value><array><data><value><int>1010</int></value>\
                 <value><int>1010</int></value></data></array></value>",
            ))
            .create_async()
            .await;

        let client = PatchworkClient::connect(&server.url()).await.expect("connect");
        assert_eq!(client.dialect, Dialect::Versioned(1010));
    }

    #[tokio::test]
    async fn test_versioned_reply_mismatch_is_error() {
        let mut server = mockito::Server::new_async().await;
        let _probe = server
            .mock("POST", "/xmlrpc/")
            .match_body(mockito::Matcher::Regex("pw_rpc_version".to_string()))
            .with_body(fault(1, "list index out of range"))
            .create_async()
            .await;
        let _reprobe = server
            .mock("POST", "/xmlrpc/")
            .match_body(mockito::Matcher::Regex("1010".to_string()))
            .with_body(response(
                "<value><array><data><value><int>1009</int></value>\
                 <value><int>1010</int></value></data></array></value>",
            ))
            .create_async()
            .await;

        let err = PatchworkClient::connect(&server.url()).await.expect_err("mismatch");
        assert!(matches!(err, KciError::RpcProtocolMismatch { got: 1009, .. }));
    }

    #[tokio::test]
    async fn test_patch_get_and_mbox() {
        let mut server = mockito::Server::new_async().await;
        let _probe = server
            .mock("POST", "/xmlrpc/")
            .match_body(mockito::Matcher::Regex("pw_rpc_version".to_string()))
            .with_body(response("<value><int>1</int></value>"))
            .create_async()
            .await;
        let _get = server
            .mock("POST", "/xmlrpc/")
            .match_body(mockito::Matcher::Regex("patch_get<".to_string()))
            .with_body(response(
                "<value><struct><member><name>name</name>\
                 <value><string>mm: fix thing</string></value></member></struct></value>",
            ))
            .create_async()
            .await;
        let _mbox = server
            .mock("POST", "/xmlrpc/")
            .match_body(mockito::Matcher::Regex("patch_get_mbox".to_string()))
            .with_body(response(
                "<value><string>From: a@example.org\nSubject: mm: fix thing\n</string></value>",
            ))
            .create_async()
            .await;

        let client = PatchworkClient::connect(&server.url()).await.expect("connect");
        let info = client.patch_get(42).await.expect("patch_get");
        assert_eq!(info.field("name").and_then(Value::as_str), Some("mm: fix thing"));

        let mbox = client.patch_get_mbox(42).await.expect("mbox");
        assert!(mbox.starts_with("From: "));
    }
}
