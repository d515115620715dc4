use clap::Subcommand;
use serde_json::json;

use crate::util::api_request;

#[derive(Subcommand)]
pub enum ThresholdCommands {
    /// Show violation thresholds
    Get,
    /// Change some thresholds, keeping the rest
    Set {
        #[arg(long)]
        hourly: Option<i64>,
        #[arg(long)]
        daily: Option<i64>,
        #[arg(long)]
        weekly: Option<i64>,
    },
    /// Replace all three thresholds
    Replace {
        #[arg(long)]
        hourly: i64,
        #[arg(long)]
        daily: i64,
        #[arg(long)]
        weekly: i64,
    },
}

#[derive(Subcommand)]
pub enum AdaptiveCommands {
    /// Show adaptive request budgets
    Get,
    /// Rescale budgets for the current load factor (0.0 - 1.0)
    Rescale {
        #[arg(long)]
        load_factor: f64,
    },
}

const THRESHOLDS_PATH: &str = "/v1/admin/abuse/thresholds";

pub async fn run(api_url: &str, token: &str, command: ThresholdCommands) -> i32 {
    match command {
        ThresholdCommands::Get => {
            api_request(
                api_url,
                reqwest::Method::GET,
                THRESHOLDS_PATH,
                Some(token),
                None,
                &[],
                false,
            )
            .await
        }
        ThresholdCommands::Set {
            hourly,
            daily,
            weekly,
        } => {
            if hourly.is_none() && daily.is_none() && weekly.is_none() {
                crate::util::exit_error(
                    "Nothing to update",
                    Some("Pass at least one of --hourly, --daily, --weekly."),
                );
            }
            api_request(
                api_url,
                reqwest::Method::POST,
                THRESHOLDS_PATH,
                Some(token),
                Some(partial_update(hourly, daily, weekly)),
                &[],
                false,
            )
            .await
        }
        ThresholdCommands::Replace {
            hourly,
            daily,
            weekly,
        } => {
            api_request(
                api_url,
                reqwest::Method::PUT,
                THRESHOLDS_PATH,
                Some(token),
                Some(json!({ "hourly": hourly, "daily": daily, "weekly": weekly })),
                &[],
                false,
            )
            .await
        }
    }
}

pub async fn run_adaptive(api_url: &str, token: &str, command: AdaptiveCommands) -> i32 {
    match command {
        AdaptiveCommands::Get => {
            api_request(
                api_url,
                reqwest::Method::GET,
                "/v1/admin/abuse/adaptive-thresholds",
                Some(token),
                None,
                &[],
                false,
            )
            .await
        }
        AdaptiveCommands::Rescale { load_factor } => {
            api_request(
                api_url,
                reqwest::Method::POST,
                "/v1/admin/abuse/adaptive-thresholds/rescale",
                Some(token),
                Some(json!({ "load_factor": load_factor })),
                &[],
                false,
            )
            .await
        }
    }
}

fn partial_update(hourly: Option<i64>, daily: Option<i64>, weekly: Option<i64>) -> serde_json::Value {
    let mut body = serde_json::Map::new();
    for (name, value) in [("hourly", hourly), ("daily", daily), ("weekly", weekly)] {
        if let Some(value) = value {
            body.insert(name.to_string(), json!(value));
        }
    }
    serde_json::Value::Object(body)
}
