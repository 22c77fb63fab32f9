use std::collections::HashSet;

use ftth_rsipstack::rsip;
use ftth_rsipstack::transport::SipAddr;
use rsip::Param;
use rsip::host_with_port::HostWithPort;
use rsip::transport::Transport;
use rsip::typed;

use crate::error::{Error, Result};

/// Headers the engine synthesizes on every locally built reply (the
/// transaction layer copies Via/From/To/Call-ID/CSeq from the request and
/// appends Content-Length and User-Agent itself). They are never copied
/// across legs when merging a relayed response, or the reply would carry
/// duplicates.
const LEG_LOCAL_HEADERS: [&str; 7] = [
    "via",
    "from",
    "to",
    "call-id",
    "cseq",
    "content-length",
    "user-agent",
];

pub(super) fn strip_rport_param(via: &mut typed::Via) {
    via.params.retain(|param| {
        if let Param::Other(name, _) = param {
            !name.value().eq_ignore_ascii_case("rport")
        } else {
            true
        }
    });
}

/// Build a transport-qualified SIP address from a registered host string.
/// Devices may register with a hostname, so this goes through the URI host
/// parser rather than `SocketAddr`.
pub(super) fn sip_addr_for(transport: Transport, host: &str, port: u16) -> Result<SipAddr> {
    let rendered = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let addr = HostWithPort::try_from(rendered.as_str()).map_err(Error::sip_stack)?;
    Ok(SipAddr {
        r#type: Some(transport),
        addr,
    })
}

fn header_name(header: &rsip::Header) -> String {
    let rendered = header.to_string();
    rendered
        .split(':')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Copy headers from `source` into `existing`, keeping whatever `existing`
/// already carries for a given name and never crossing the leg-local set.
/// The first occurrence of a repeated source header wins.
pub(super) fn merge_headers(existing: &mut rsip::headers::Headers, source: &rsip::headers::Headers) {
    let mut present: HashSet<String> = existing.iter().map(header_name).collect();
    for header in source.iter() {
        let name = header_name(header);
        if name.is_empty() || LEG_LOCAL_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if !present.insert(name) {
            continue;
        }
        existing.push(header.clone());
    }
}
