//! Slot discovery.
//!
//! The cape runs an XML-RPC service (`http://<host>:8000/acme`) whose
//! `info(slot)` method returns a free-text dump of the probe EEPROM, or a
//! message containing `Failed` when the slot is empty. This module holds
//! the client for that service and the parser for its descriptions.

use crate::error::{DiscoveryError, SlotParseError};
use crate::models::ProbeKind;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, trace};

/// Marker present in descriptions of empty slots.
const EMPTY_SLOT_MARKER: &str = "Failed";
const SHUNT_FIELD: &str = "R_Shunt:";
const SHUNT_UNIT: &str = "uOhm";
const POWER_SWITCH_MARKER: &str = "Has Power Switch";

/// Source of per-slot probe descriptions.
pub trait SlotInfoSource {
    /// Free-text description of `slot` (1-based).
    fn slot_info(&self, slot: usize) -> impl Future<Output = Result<String, DiscoveryError>> + Send;
}

/// Static identity of a probe, parsed from its slot description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeDescriptor {
    pub kind: ProbeKind,
    /// Shunt resistance in micro-ohms.
    pub shunt_uohm: u32,
    pub power_switch: bool,
}

/// Parsed state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Empty,
    Populated(ProbeDescriptor),
}

/// Parse a slot description.
///
/// Probe type tokens are matched in the order JACK, USB, HE10. The shunt
/// resistance is the integer between `R_Shunt:` and `uOhm`.
pub fn parse_slot_info(info: &str) -> Result<SlotStatus, SlotParseError> {
    if info.contains(EMPTY_SLOT_MARKER) {
        return Ok(SlotStatus::Empty);
    }

    let kind = [ProbeKind::Jack, ProbeKind::Usb, ProbeKind::He10]
        .into_iter()
        .find(|k| info.contains(k.token()))
        .ok_or(SlotParseError::MissingType)?;

    let shunt_start = info
        .find(SHUNT_FIELD)
        .map(|pos| pos + SHUNT_FIELD.len())
        .ok_or(SlotParseError::MissingShunt)?;
    let rest = &info[shunt_start..];
    let shunt_end = rest.find(SHUNT_UNIT).ok_or(SlotParseError::MissingShunt)?;
    let shunt_text = rest[..shunt_end].trim();
    let shunt_uohm = shunt_text
        .parse::<u32>()
        .map_err(|_| SlotParseError::InvalidShunt(shunt_text.to_string()))?;

    Ok(SlotStatus::Populated(ProbeDescriptor {
        kind,
        shunt_uohm,
        power_switch: info.contains(POWER_SWITCH_MARKER),
    }))
}

/// XML-RPC client for the cape's slot information service.
pub struct XmlRpcDiscovery {
    endpoint: String,
    http_client: reqwest::Client,
}

impl XmlRpcDiscovery {
    /// Create a client for `http://{host}:{port}{path}`.
    pub fn new(
        host: &str,
        port: u16,
        path: &str,
        timeout: Duration,
    ) -> Result<Self, DiscoveryError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DiscoveryError::Unreachable(e.to_string()))?;

        Ok(Self {
            endpoint: format!("http://{}:{}{}", host, port, path),
            http_client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl SlotInfoSource for XmlRpcDiscovery {
    async fn slot_info(&self, slot: usize) -> Result<String, DiscoveryError> {
        let body = method_call("info", &slot.to_string());
        debug!("XML-RPC info({}) -> {}", slot, self.endpoint);

        let response = self
            .http_client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    DiscoveryError::Unreachable(e.to_string())
                } else {
                    DiscoveryError::Malformed(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(DiscoveryError::Fault {
                code: i64::from(response.status().as_u16()),
                message: format!("HTTP {}", response.status()),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| DiscoveryError::Malformed(e.to_string()))?;
        trace!("XML-RPC response for slot {}: {}", slot, text);

        parse_method_response(&text)
    }
}

/// Build an XML-RPC call with a single string parameter.
fn method_call(method: &str, param: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n<methodCall><methodName>{}</methodName>\
         <params><param><value><string>{}</string></value></param></params></methodCall>\n",
        method,
        escape(param)
    )
}

/// Extract the string result (or fault) from an XML-RPC response.
fn parse_method_response(xml: &str) -> Result<String, DiscoveryError> {
    if let Some(fault) = element(xml, "fault") {
        let code = member_value(fault, "faultCode")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(0);
        let message = member_value(fault, "faultString")
            .map(unescape)
            .unwrap_or_default();
        return Err(DiscoveryError::Fault { code, message });
    }

    let param = element(xml, "param")
        .ok_or_else(|| DiscoveryError::Malformed("response has no <param>".to_string()))?;
    let value = element(param, "value")
        .ok_or_else(|| DiscoveryError::Malformed("response has no <value>".to_string()))?;

    // <value>text</value> is a string too
    let text = element(value, "string").unwrap_or(value);
    Ok(unescape(text))
}

/// Inner text of the first `tag` element.
///
/// Attributes and whitespace inside the tags are accepted; a
/// self-closing `<tag/>` yields an empty string.
fn element<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}", tag);
    let mut from = 0;
    while let Some(pos) = xml[from..].find(&open) {
        let after = from + pos + open.len();
        match xml[after..].chars().next() {
            Some(c) if c == '>' || c == '/' || c.is_whitespace() => {
                let tag_end = after + xml[after..].find('>')?;
                if xml[..tag_end].ends_with('/') {
                    return Some("");
                }
                let body = tag_end + 1;
                let end = body + closing_tag(&xml[body..], tag)?;
                return Some(&xml[body..end]);
            }
            // a longer tag name sharing the prefix, e.g. <params>
            _ => from = after,
        }
    }
    None
}

/// Offset of the first `</tag>` (with optional whitespace before `>`).
fn closing_tag(xml: &str, tag: &str) -> Option<usize> {
    let close = format!("</{}", tag);
    let mut from = 0;
    while let Some(pos) = xml[from..].find(&close) {
        let start = from + pos;
        if xml[start + close.len()..].trim_start().starts_with('>') {
            return Some(start);
        }
        from = start + close.len();
    }
    None
}

/// Value text of a struct member in a fault response.
fn member_value<'a>(fault: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!("<name>{}</name>", name);
    let after = &fault[fault.find(&marker)? + marker.len()..];
    let value = element(after, "value")?;
    ["int", "i4", "string"]
        .into_iter()
        .find_map(|t| element(value, t))
        .or(Some(value))
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#10;", "\n")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const JACK_INFO: &str = "PowerProbe JACK @slot 1:\tReB\n\tHas Power Switch\n\
                             \tR_Shunt: 10000 uOhm\n\tSerial Number: ac-3e-1-5a\n";

    #[test]
    fn test_parse_populated_slot() {
        let status = parse_slot_info(JACK_INFO).unwrap();
        assert_eq!(
            status,
            SlotStatus::Populated(ProbeDescriptor {
                kind: ProbeKind::Jack,
                shunt_uohm: 10_000,
                power_switch: true,
            })
        );
    }

    #[test]
    fn test_parse_he10_without_switch() {
        let info = "PowerProbe HE10 @slot 4:\tReB\n\tR_Shunt: 5000 uOhm\n";
        let status = parse_slot_info(info).unwrap();
        assert_eq!(
            status,
            SlotStatus::Populated(ProbeDescriptor {
                kind: ProbeKind::He10,
                shunt_uohm: 5000,
                power_switch: false,
            })
        );
    }

    #[test]
    fn test_parse_empty_slot() {
        let status = parse_slot_info("Failed to read EEPROM of probe @slot 2").unwrap();
        assert_eq!(status, SlotStatus::Empty);
    }

    #[test]
    fn test_parse_failures() {
        assert_eq!(
            parse_slot_info("PowerProbe ??? @slot 1:\tR_Shunt: 10 uOhm"),
            Err(SlotParseError::MissingType)
        );
        assert_eq!(
            parse_slot_info("PowerProbe USB @slot 1:\tReB\n"),
            Err(SlotParseError::MissingShunt)
        );
        assert_eq!(
            parse_slot_info("PowerProbe USB @slot 1:\tR_Shunt: 10000\n"),
            Err(SlotParseError::MissingShunt)
        );
        assert_eq!(
            parse_slot_info("PowerProbe USB @slot 1:\tR_Shunt: ten uOhm\n"),
            Err(SlotParseError::InvalidShunt("ten".to_string()))
        );
    }

    #[test]
    fn test_method_call_body() {
        let body = method_call("info", "3");
        assert!(body.contains("<methodName>info</methodName>"));
        assert!(body.contains("<string>3</string>"));
    }

    #[test]
    fn test_parse_method_response() {
        let xml = "<?xml version='1.0'?>\n<methodResponse>\n<params>\n<param>\n\
                   <value><string>PowerProbe USB @slot 2:\tR_Shunt: 20000 uOhm &amp; more</string></value>\n\
                   </param>\n</params>\n</methodResponse>\n";
        let text = parse_method_response(xml).unwrap();
        assert_eq!(text, "PowerProbe USB @slot 2:\tR_Shunt: 20000 uOhm & more");

        let bare = "<methodResponse><params><param><value>Failed</value></param></params></methodResponse>";
        assert_eq!(parse_method_response(bare).unwrap(), "Failed");
    }

    #[test]
    fn test_parse_empty_string_response() {
        let xml = "<methodResponse><params><param><value><string/></value></param></params></methodResponse>";
        assert_eq!(parse_method_response(xml).unwrap(), "");

        let spaced = "<methodResponse><params><param>\n  <value><string /></value>\n</param></params></methodResponse>";
        assert_eq!(parse_method_response(spaced).unwrap(), "");
    }

    #[test]
    fn test_parse_response_with_attributes() {
        let xml = concat!(
            "<?xml version=\"1.0\"?>\n",
            "<methodResponse xmlns:ex=\"http://ws.apache.org/xmlrpc/namespaces/extensions\">",
            "<params><param><value><string xml:space=\"preserve\">PowerProbe JACK @slot 1:\tReB\n</string ></value></param></params>",
            "</methodResponse>"
        );
        assert_eq!(
            parse_method_response(xml).unwrap(),
            "PowerProbe JACK @slot 1:\tReB\n"
        );
    }

    #[test]
    fn test_element_skips_longer_tag_names() {
        let xml = "<params><param><value>x</value></param></params>";
        assert_eq!(element(xml, "param"), Some("<value>x</value>"));
        assert_eq!(element("<value/>", "value"), Some(""));
        assert_eq!(element("<value>unterminated", "value"), None);
    }

    #[test]
    fn test_parse_fault_response() {
        let xml = "<methodResponse><fault><value><struct>\
                   <member><name>faultCode</name><value><int>1</int></value></member>\
                   <member><name>faultString</name><value><string>&lt;class 'KeyError'&gt;</string></value></member>\
                   </struct></value></fault></methodResponse>";
        assert_eq!(
            parse_method_response(xml),
            Err(DiscoveryError::Fault {
                code: 1,
                message: "<class 'KeyError'>".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_malformed_response() {
        assert!(matches!(
            parse_method_response("<html>502</html>"),
            Err(DiscoveryError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        // Port 9 (discard) on localhost is closed in test environments.
        let client =
            XmlRpcDiscovery::new("127.0.0.1", 9, "/acme", Duration::from_secs(2)).unwrap();
        assert_eq!(client.endpoint(), "http://127.0.0.1:9/acme");
        assert!(matches!(
            client.slot_info(1).await,
            Err(DiscoveryError::Unreachable(_))
        ));
    }
}
