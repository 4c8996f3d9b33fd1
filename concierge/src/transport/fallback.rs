//! Transport with a preferred and a fallback endpoint.
//!
//! [`FallbackTransport`] opens through its preferred transport first. If
//! that fails for a network reason it tries the fallback. A rejected
//! handshake is returned immediately: the ticket is spent either way and
//! the fallback would refuse it too.

use super::{Link, Ticket, Transport, TransportError, TransportType};

/// Transport that tries a preferred transport, then a secondary.
///
/// # Type Parameters
///
/// - `P`: The preferred (primary) transport type.
/// - `F`: The fallback (secondary) transport type.
pub struct FallbackTransport<P: Transport, F: Transport> {
    preferred: P,
    fallback: F,
}

impl<P: Transport, F: Transport> FallbackTransport<P, F> {
    /// Create a new fallback transport.
    #[must_use]
    pub const fn new(preferred: P, fallback: F) -> Self {
        Self {
            preferred,
            fallback,
        }
    }

    /// The preferred transport.
    pub const fn preferred(&self) -> &P {
        &self.preferred
    }

    /// The fallback transport.
    pub const fn fallback(&self) -> &F {
        &self.fallback
    }
}

impl<P: Transport, F: Transport> Transport for FallbackTransport<P, F> {
    async fn open(&self, ticket: &Ticket) -> Result<Link, TransportError> {
        match self.preferred.open(ticket).await {
            Ok(link) => Ok(link),
            Err(e) if e.is_auth_failure() => Err(e),
            Err(preferred_err) => {
                tracing::info!(
                    err = %preferred_err,
                    preferred = %self.preferred.transport_type(),
                    fallback = %self.fallback.transport_type(),
                    "preferred transport failed, trying fallback"
                );
                self.fallback.open(ticket).await
            }
        }
    }

    /// Reports the preferred transport's type.
    fn transport_type(&self) -> TransportType {
        self.preferred.transport_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackTransport;

    #[tokio::test]
    async fn uses_preferred_when_available() {
        let (preferred, p_server) = LoopbackTransport::create_pair();
        let (fallback, f_server) = LoopbackTransport::create_pair();
        let transport = FallbackTransport::new(preferred, fallback);

        transport.open(&Ticket::new("t")).await.unwrap();
        assert_eq!(p_server.open_attempts(), 1);
        assert_eq!(f_server.open_attempts(), 0);
    }

    #[tokio::test]
    async fn falls_back_on_network_failure() {
        let (preferred, p_server) = LoopbackTransport::create_pair();
        let (fallback, f_server) = LoopbackTransport::create_pair();
        p_server.go_offline();
        let transport = FallbackTransport::new(preferred, fallback);

        transport.open(&Ticket::new("t")).await.unwrap();
        assert!(f_server.is_linked());
        assert!(!p_server.is_linked());
    }

    #[tokio::test]
    async fn rejection_is_not_retried_on_fallback() {
        let (preferred, p_server) = LoopbackTransport::create_pair();
        let (fallback, f_server) = LoopbackTransport::create_pair();
        p_server.reject_with("spent ticket");
        let transport = FallbackTransport::new(preferred, fallback);

        let err = transport.open(&Ticket::new("t")).await.unwrap_err();
        assert!(err.is_auth_failure());
        assert_eq!(f_server.open_attempts(), 0);
    }

    #[tokio::test]
    async fn both_down_reports_fallback_error() {
        let (preferred, p_server) = LoopbackTransport::create_pair();
        let (fallback, f_server) = LoopbackTransport::create_pair();
        p_server.go_offline();
        f_server.go_offline();
        let transport = FallbackTransport::new(preferred, fallback);

        let err = transport.open(&Ticket::new("t")).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
        assert_eq!(transport.transport_type(), TransportType::Loopback);
    }
}
