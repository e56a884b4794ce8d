use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use slotpay_core::payment::{GatewayError, GatewaySession, PaymentGateway, SessionRequest};
use slotpay_core::secret::Masked;
use std::time::Duration;
use tracing::{debug, error};

/// Hosted-checkout gateway reached over HTTPS.
///
/// `POST {base_url}/sessions` with the [`SessionRequest`] as JSON; the gateway answers with a
/// [`GatewaySession`]. The local transaction id travels as the session reference and comes back
/// on webhook deliveries.
pub struct HttpPaymentGateway {
    name: String,
    base_url: String,
    api_key: Option<Masked<String>>,
    client: Client,
}

impl HttpPaymentGateway {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<Masked<String>>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_session(&self, request: &SessionRequest) -> Result<GatewaySession, GatewayError> {
        let url = format!("{}/sessions", self.base_url.trim_end_matches('/'));
        let mut call = self.client.post(&url).json(request);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key.expose());
        }

        let response = call.send().await.map_err(|e| {
            error!(gateway = %self.name, %url, error = %e, "Gateway request failed");
            GatewayError::Unavailable(e.to_string())
        })?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::Unavailable(format!("gateway answered {status}")));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected(format!("{status}: {detail}")));
        }

        let session: GatewaySession = response
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("unreadable gateway response: {e}")))?;
        debug!(gateway = %self.name, session_id = %session.session_id, "Gateway session created");
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_unreachable_gateway_is_retryable() {
        // Nothing listens on the discard port locally.
        let gateway = HttpPaymentGateway::new("datatrans", "http://127.0.0.1:9", None, Duration::from_secs(2)).unwrap();
        let request = SessionRequest {
            transaction_id: Uuid::new_v4(),
            reservation_id: Uuid::new_v4(),
            tenant_id: "T".into(),
            amount: 8000,
            currency: "CHF".into(),
        };
        assert!(matches!(
            gateway.create_session(&request).await,
            Err(GatewayError::Unavailable(_))
        ));
    }
}
