// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of GridFlow.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

use anyhow::{Context, Result};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

const GEOIP_API: &str = "http://ip-api.com/json/";

/// Rough coordinates of this host, derived from its public IP. Only used
/// when no latitude/longitude is configured; sunrise/sunset tolerate the
/// city-level accuracy.
pub async fn lookup() -> Result<(f64, f64)> {
    lookup_from(GEOIP_API).await
}

async fn lookup_from(url: &str) -> Result<(f64, f64)> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let response: Value = client.get(url).send().await?.json().await?;

    if let Some(query) = response.get("query").and_then(Value::as_str) {
        info!("🌍 IP Address: {}", query);
    }
    if let (Some(city), Some(country)) = (
        response.get("city").and_then(Value::as_str),
        response.get("country").and_then(Value::as_str),
    ) {
        info!("🌍 Location: {}, {}", city, country);
    }

    let lat = response
        .get("lat")
        .and_then(Value::as_f64)
        .context("geo-ip response carries no latitude")?;
    let lon = response
        .get("lon")
        .and_then(Value::as_f64)
        .context("geo-ip response carries no longitude")?;
    info!("🌍 Coordinates: (Lat: {}, Lng: {})", lat, lon);
    Ok((lat, lon))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_parses_coordinates() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/json/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"query":"203.0.113.7","city":"Berlin","country":"Germany","lat":52.52,"lon":13.405}"#,
            )
            .create_async()
            .await;

        let url = format!("{}/json/", server.url());
        let (lat, lon) = lookup_from(&url).await.expect("lookup");
        assert!((lat - 52.52).abs() < 1e-9);
        assert!((lon - 13.405).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_lookup_without_coordinates_fails() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/json/")
            .with_status(200)
            .with_body(r#"{"status":"fail"}"#)
            .create_async()
            .await;

        let url = format!("{}/json/", server.url());
        assert!(lookup_from(&url).await.is_err());
    }
}
