//! Route and destination resolution.

use crate::config::{RoutingConfig, SlackConfig};

/// Resolves the route key for an alert type.
///
/// The longest configured prefix that matches `alert_type` wins. Alerts
/// without a type, or whose type matches no prefix, go to the default route.
pub fn resolve_route_key(alert_type: Option<&str>, routing: &RoutingConfig) -> String {
    alert_type
        .and_then(|t| {
            routing
                .by_type_prefix
                .iter()
                .filter(|(prefix, _)| t.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len())
                .map(|(_, route)| route.clone())
        })
        .unwrap_or_else(|| routing.default_route.clone())
}

/// The route a delivery should go to: its own key when set, otherwise the
/// key resolved from the alert type.
pub fn effective_route_key(
    delivery_route: &str,
    alert_type: Option<&str>,
    routing: &RoutingConfig,
) -> String {
    let trimmed = delivery_route.trim();
    if trimmed.is_empty() {
        resolve_route_key(alert_type, routing)
    } else {
        trimmed.to_string()
    }
}

/// Looks up the webhook URL for a route. Blank URLs count as missing.
pub fn resolve_webhook<'a>(route_key: &str, slack: &'a SlackConfig) -> Option<&'a str> {
    slack
        .webhooks
        .get(route_key)
        .map(|url| url.trim())
        .filter(|url| !url.is_empty())
}
