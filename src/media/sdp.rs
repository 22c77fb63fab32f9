/// Result of one session-description rewrite: the new body plus the peer
/// address that was replaced, reported back so the caller can route media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpRewrite {
    pub sdp: String,
    pub media_host: Option<String>,
    pub media_port: u16,
}

/// Rewrite the connection address and media port of an SDP body.
///
/// Lines are treated positionally, not semantically: the last space-separated
/// token of `o=`/`c=` lines is the address, the second token of `m=` lines is
/// the port. The first address seen is captured as `media_host` (origin and
/// connection lines carry the same value in practice); an unparsable `m=` port
/// is reported as 0. Everything else passes through trimmed, and the result is
/// reassembled with CRLF line endings plus one trailing CRLF.
pub fn rewrite_sdp(body: &str, new_host: &str, new_port: u16) -> SdpRewrite {
    let mut media_host: Option<String> = None;
    let mut media_port: u16 = 0;
    let mut rewritten: Vec<String> = Vec::new();

    for line in body.split('\n') {
        let line = line.trim();
        if line.starts_with("o=") || line.starts_with("c=") {
            let mut tokens: Vec<&str> = line.split(' ').collect();
            if let Some(last) = tokens.last_mut() {
                if media_host.is_none() {
                    media_host = Some((*last).to_string());
                }
                *last = new_host;
            }
            rewritten.push(tokens.join(" "));
            continue;
        }
        if line.starts_with("m=") {
            let mut tokens: Vec<String> = line.split(' ').map(str::to_string).collect();
            if tokens.len() > 1 {
                media_port = tokens[1].trim().parse().unwrap_or(0);
                tokens[1] = new_port.to_string();
            }
            rewritten.push(tokens.join(" "));
            continue;
        }
        rewritten.push(line.to_string());
    }

    let mut sdp = rewritten.join("\r\n");
    sdp.push_str("\r\n");
    SdpRewrite {
        sdp,
        media_host,
        media_port,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\n\
        o=- 123 456 IN IP4 10.0.0.1\n\
        s=Play\n\
        c=IN IP4 10.0.0.1\n\
        t=0 0\n\
        m=video 5004 RTP/AVP 96\n\
        a=recvonly";

    #[test]
    fn rewrites_address_and_port() {
        let rewrite = rewrite_sdp(OFFER, "203.0.113.9", 7000);
        assert_eq!(rewrite.media_host.as_deref(), Some("10.0.0.1"));
        assert_eq!(rewrite.media_port, 5004);
        assert!(rewrite.sdp.contains("o=- 123 456 IN IP4 203.0.113.9\r\n"));
        assert!(rewrite.sdp.contains("c=IN IP4 203.0.113.9\r\n"));
        assert!(rewrite.sdp.contains("m=video 7000 RTP/AVP 96\r\n"));
        assert!(rewrite.sdp.ends_with("a=recvonly\r\n"));
    }

    #[test]
    fn captures_only_the_first_address() {
        let body = "o=- 1 1 IN IP4 10.0.0.1\nc=IN IP4 10.0.0.2\nm=video 5004 RTP/AVP 96";
        let rewrite = rewrite_sdp(body, "203.0.113.9", 7000);
        assert_eq!(rewrite.media_host.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn rewriting_twice_is_idempotent_on_addresses() {
        let first = rewrite_sdp(OFFER, "203.0.113.9", 7000);
        let second = rewrite_sdp(&first.sdp, "203.0.113.9", 7000);
        // The address and port fields stay put; the second pass re-discovers
        // the values the first one wrote. (Each pass appends its own trailing
        // CRLF, so the bodies are not byte-identical.)
        assert!(second.sdp.contains("o=- 123 456 IN IP4 203.0.113.9\r\n"));
        assert!(second.sdp.contains("c=IN IP4 203.0.113.9\r\n"));
        assert!(second.sdp.contains("m=video 7000 RTP/AVP 96\r\n"));
        assert_eq!(second.media_host.as_deref(), Some("203.0.113.9"));
        assert_eq!(second.media_port, 7000);
    }

    #[test]
    fn offer_and_answer_capture_distinct_peers() {
        let offer = rewrite_sdp(OFFER, "192.168.8.10", 20000);
        let answer_body = "v=0\n\
            o=34020000001320000001 0 0 IN IP4 192.168.8.21\n\
            s=Play\n\
            c=IN IP4 192.168.8.21\n\
            t=0 0\n\
            m=video 6200 TCP/RTP/AVP 96";
        let answer = rewrite_sdp(answer_body, "10.1.0.10", 30000);
        assert_eq!(offer.media_host.as_deref(), Some("10.0.0.1"));
        assert_eq!(offer.media_port, 5004);
        assert_eq!(answer.media_host.as_deref(), Some("192.168.8.21"));
        assert_eq!(answer.media_port, 6200);
        assert!(answer.sdp.contains("m=video 30000 TCP/RTP/AVP 96\r\n"));
    }

    #[test]
    fn unparsable_media_port_reports_zero() {
        let rewrite = rewrite_sdp("m=video abc RTP/AVP 96", "203.0.113.9", 7000);
        assert_eq!(rewrite.media_port, 0);
        assert_eq!(rewrite.sdp, "m=video 7000 RTP/AVP 96\r\n");
    }

    #[test]
    fn passthrough_lines_are_trimmed_and_crlf_joined() {
        let rewrite = rewrite_sdp("v=0\r\n  a=setup:active  \r\n", "203.0.113.9", 7000);
        assert_eq!(rewrite.sdp, "v=0\r\na=setup:active\r\n\r\n");
    }
}
