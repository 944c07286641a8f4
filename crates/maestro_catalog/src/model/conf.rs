//! Singleton configurations. Each lives in a one-row table; secret
//! fields are encrypted at rest and carried decrypted here.

/// Warehouse connection settings.
#[derive(Debug, Clone, Default)]
pub struct WarehouseConf {
    pub project_id: String,
    pub email: String,
    pub private_key_id: String,
    pub key: String,
    pub bucket: String,
}

/// OAuth client settings for the (out-of-process) control surface.
#[derive(Debug, Clone, Default)]
pub struct OAuthConf {
    pub client_id: String,
    pub secret: String,
    pub redirect: String,
    pub allowed_domain: String,
    pub cookie_secret: String,
}

/// Version-control mirror settings.
#[derive(Debug, Clone, Default)]
pub struct GitConf {
    pub url: String,
    pub token: String,
}

/// Alert webhook settings.
#[derive(Debug, Clone, Default)]
pub struct SlackConf {
    pub url: String,
    pub username: String,
    pub channel: String,
    pub icon_emoji: String,
    /// Base URL of this deployment, substituted into alert links.
    pub url_prefix: String,
}
