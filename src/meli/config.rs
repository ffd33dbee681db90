use once_cell::sync::Lazy;
use std::env;

pub static ML_CLIENT_ID: Lazy<String> =
    Lazy::new(|| env::var("ML_CLIENT_ID").unwrap_or_default());

pub static ML_CLIENT_SECRET: Lazy<String> =
    Lazy::new(|| env::var("ML_CLIENT_SECRET").unwrap_or_default());

pub static ML_REDIRECT_URI: Lazy<String> =
    Lazy::new(|| env::var("ML_REDIRECT_URI").unwrap_or_default());

pub static API_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("ML_API_ROOT").unwrap_or_else(|_| "https://api.mercadolibre.com".to_string())
});

pub static SITE_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("ML_SITE_ROOT").unwrap_or_else(|_| "https://www.mercadolibre.com.ar".to_string())
});

pub static AUTH_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("ML_AUTH_ROOT").unwrap_or_else(|_| "https://auth.mercadolibre.com.ar".to_string())
});

pub static OAUTH_TOKEN_URL: Lazy<String> = Lazy::new(|| format!("{}/oauth/token", *API_ROOT));
