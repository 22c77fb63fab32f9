use ftth_rsipstack::rsip::{Response, SipMessage};
use ftth_rsipstack::transaction::transaction::Transaction;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Message source of an outbound transaction. The proxy only needs the
/// receive side, so handlers are written against this seam and the engine's
/// `Transaction` plugs in behind it.
pub(super) trait ResponseSource {
    async fn next_message(&mut self) -> Option<SipMessage>;
}

impl ResponseSource for Transaction {
    async fn next_message(&mut self) -> Option<SipMessage> {
        self.receive().await
    }
}

/// Status codes that signal call progress rather than an outcome. 1xx codes
/// outside this set (e.g. 182) terminate the wait like any final response.
pub(super) fn is_progress(code: u16) -> bool {
    matches!(code, 100 | 101 | 180 | 183)
}

/// Consume responses until the first non-progress status arrives and return
/// it. A deliberate loop, not recursion: a peer flooding provisional
/// responses must not grow the stack. Cancellation of the proxy-wide token
/// aborts the wait with `Error::Cancelled` and yields no response.
pub(super) async fn wait_answer<S: ResponseSource>(
    cancel: &CancellationToken,
    source: &mut S,
) -> Result<Response> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            message = source.next_message() => match message {
                Some(SipMessage::Response(response)) => {
                    if is_progress(response.status_code.code()) {
                        continue;
                    }
                    return Ok(response);
                }
                Some(SipMessage::Request(_)) => continue,
                None => {
                    return Err(Error::SipStack(
                        "transaction ended without a final response".into(),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftth_rsipstack::rsip;
    use ftth_rsipstack::rsip::StatusCode;
    use std::collections::VecDeque;

    struct Scripted {
        messages: VecDeque<SipMessage>,
    }

    impl Scripted {
        fn new(codes: &[StatusCode]) -> Self {
            let messages = codes
                .iter()
                .map(|status| {
                    SipMessage::Response(rsip::Response {
                        status_code: status.clone(),
                        version: rsip::Version::V2,
                        headers: rsip::Headers::default(),
                        body: Vec::new(),
                    })
                })
                .collect();
            Self { messages }
        }
    }

    impl ResponseSource for Scripted {
        async fn next_message(&mut self) -> Option<SipMessage> {
            match self.messages.pop_front() {
                Some(message) => Some(message),
                // An exhausted script hangs like an idle transaction would.
                None => std::future::pending().await,
            }
        }
    }

    #[tokio::test]
    async fn progress_responses_are_skipped() {
        let cancel = CancellationToken::new();
        let mut source = Scripted::new(&[
            StatusCode::Ringing,
            StatusCode::SessionProgress,
            StatusCode::SessionProgress,
            StatusCode::OK,
        ]);
        let response = wait_answer(&cancel, &mut source).await.expect("final");
        assert_eq!(response.status_code, StatusCode::OK);
    }

    #[tokio::test]
    async fn first_failure_is_returned_as_final() {
        let cancel = CancellationToken::new();
        let mut source = Scripted::new(&[StatusCode::Trying, StatusCode::BusyHere]);
        let response = wait_answer(&cancel, &mut source).await.expect("final");
        assert_eq!(response.status_code, StatusCode::BusyHere);
    }

    #[tokio::test]
    async fn cancellation_yields_no_response() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut source = Scripted::new(&[]);
        let err = wait_answer(&cancel, &mut source)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, Error::Cancelled));
    }
}
