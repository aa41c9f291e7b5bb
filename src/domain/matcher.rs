use crate::domain::models::{RequestId, RequestState};
use crate::domain::request::TimedRequest;

/// Maps a discovered advertisement to at most one scanning request.
pub struct DeviceMatcher;

impl DeviceMatcher {
    /// Exact, case-sensitive match of the advertised name against each
    /// request's target name, then of the advertised alias value against
    /// each target alias. Only requests still in `Scanning` are eligible;
    /// the first hit in insertion order wins.
    pub fn find(
        name: Option<&str>,
        alias_value: Option<&str>,
        requests: &[TimedRequest],
    ) -> Option<RequestId> {
        let scanning = || {
            requests
                .iter()
                .filter(|r| r.state() == RequestState::Scanning)
        };

        if let Some(name) = name {
            if let Some(request) = scanning().find(|r| r.target().name == name) {
                return Some(request.id());
            }
        }

        let alias_value = alias_value?;
        scanning()
            .find(|r| r.target().alias.as_deref() == Some(alias_value))
            .map(|r| r.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::ConnectRequest;

    fn scanning(request: ConnectRequest) -> TimedRequest {
        let mut request = TimedRequest::new(request);
        request.set_state(RequestState::Scanning);
        request
    }

    #[test]
    fn test_name_match_wins_over_alias() {
        let by_alias = scanning(ConnectRequest::new("Other").alias("Lock-01"));
        let by_name = scanning(ConnectRequest::new("Lock-01"));
        let requests = vec![by_alias, by_name];

        let id = DeviceMatcher::find(Some("Lock-01"), Some("Lock-01"), &requests);
        assert_eq!(id, Some(requests[1].id()));
    }

    #[test]
    fn test_alias_match() {
        let requests = vec![
            scanning(ConnectRequest::new("Lock-01")),
            scanning(ConnectRequest::new("Lock-02").alias("AA:BB:CC:DD:EE:FF")),
        ];
        let id = DeviceMatcher::find(Some("LYS"), Some("AA:BB:CC:DD:EE:FF"), &requests);
        assert_eq!(id, Some(requests[1].id()));
    }

    #[test]
    fn test_exact_and_case_sensitive() {
        let requests = vec![scanning(ConnectRequest::new("Lock-01").alias("aa:bb"))];
        assert_eq!(DeviceMatcher::find(Some("lock-01"), None, &requests), None);
        assert_eq!(DeviceMatcher::find(Some("Lock-0"), None, &requests), None);
        assert_eq!(DeviceMatcher::find(Some("Lock-011"), None, &requests), None);
        assert_eq!(DeviceMatcher::find(None, Some("AA:BB"), &requests), None);
    }

    #[test]
    fn test_first_in_insertion_order() {
        let requests = vec![
            scanning(ConnectRequest::new("Lock-01")),
            scanning(ConnectRequest::new("Lock-01").alias("x")),
        ];
        let id = DeviceMatcher::find(Some("Lock-01"), None, &requests);
        assert_eq!(id, Some(requests[0].id()));
    }

    #[test]
    fn test_skips_requests_past_scanning() {
        let mut connecting = scanning(ConnectRequest::new("Lock-01"));
        connecting.set_state(RequestState::Connecting);
        let later = scanning(ConnectRequest::new("Lock-01").alias("x"));
        let requests = vec![connecting, later];

        let id = DeviceMatcher::find(Some("Lock-01"), None, &requests);
        assert_eq!(id, Some(requests[1].id()));

        let idle = vec![TimedRequest::new(ConnectRequest::new("Lock-01"))];
        assert_eq!(DeviceMatcher::find(Some("Lock-01"), None, &idle), None);
    }
}
