use slotpay_core::events::EventPublisher;
use slotpay_core::payment::PaymentGateway;
use slotpay_core::repository::{PaymentStore, RateLimitStore, ReservationStore};
use slotpay_core::secret::Masked;
use slotpay_core::Clock;
use slotpay_engine::{ExpirySweeper, PaymentCoordinator, RateLimiter, Reconciler, ReservationManager, WebhookProcessor};
use slotpay_store::app_config::{Config, RateLimitConfig};
use std::sync::Arc;
use std::time::Duration;

/// Storage, broker and gateway implementations chosen at startup.
pub struct Backends {
    pub reservations: Arc<dyn ReservationStore>,
    pub payments: Arc<dyn PaymentStore>,
    pub rate_limits: Arc<dyn RateLimitStore>,
    pub events: Arc<dyn EventPublisher>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone, Debug)]
pub struct ApiSettings {
    pub default_hold: Duration,
    pub rate_limit: RateLimitConfig,
    pub cron_secret: Masked<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub reservations: Arc<ReservationManager>,
    pub payments: Arc<PaymentCoordinator>,
    pub webhooks: Arc<WebhookProcessor>,
    pub reconciler: Arc<Reconciler>,
    pub sweeper: Arc<ExpirySweeper>,
    pub rate_limiter: Arc<RateLimiter>,
    pub clock: Arc<dyn Clock>,
    pub settings: Arc<ApiSettings>,
}

impl AppState {
    pub fn new(backends: Backends, config: &Config) -> Self {
        let reservations = Arc::new(
            ReservationManager::new(backends.reservations, backends.events.clone(), backends.clock.clone())
                .with_max_ttl(Duration::from_secs(config.booking.max_hold_seconds)),
        );
        let payments = Arc::new(PaymentCoordinator::new(
            backends.payments.clone(),
            reservations.clone(),
            backends.gateway,
            backends.clock.clone(),
        ));
        let webhooks = Arc::new(WebhookProcessor::new(
            config.webhooks.secrets.clone(),
            backends.payments.clone(),
            reservations.clone(),
            backends.events,
            backends.clock.clone(),
        ));

        Self {
            payments,
            webhooks,
            reconciler: Arc::new(Reconciler::new(backends.payments, reservations.clone())),
            sweeper: Arc::new(ExpirySweeper::new(reservations.clone())),
            rate_limiter: Arc::new(RateLimiter::new(backends.rate_limits, backends.clock.clone())),
            reservations,
            clock: backends.clock,
            settings: Arc::new(ApiSettings {
                default_hold: Duration::from_secs(config.booking.default_hold_seconds),
                rate_limit: config.rate_limit.clone(),
                cron_secret: config.cron.secret.clone(),
            }),
        }
    }
}
