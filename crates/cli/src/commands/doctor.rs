use secrecy::ExposeSecret;
use serde::Serialize;

use clerky_core::config::{AppConfig, LlmProvider, LoadOptions};
use clerky_db::connect_with_settings;

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: String,
    status: String,
    detail: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    status: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json: bool) -> String {
    let mut checks = Vec::new();

    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config".to_string(),
                status: "ok".to_string(),
                detail: "configuration loaded and validated".to_string(),
            });
            Some(config)
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config".to_string(),
                status: "error".to_string(),
                detail: error.to_string(),
            });
            None
        }
    };

    if let Some(config) = &config {
        checks.push(check_oracle_credentials(config));
        checks.push(check_database(config));
    }

    let status = if checks.iter().any(|c| c.status == "error") { "error" } else { "ok" };
    let report = DoctorReport { status: status.to_string(), checks };

    if json {
        serde_json::to_string_pretty(&report)
            .unwrap_or_else(|error| format!("{{\"status\":\"error\",\"detail\":\"{error}\"}}"))
    } else {
        render_human(&report)
    }
}

fn check_oracle_credentials(config: &AppConfig) -> DoctorCheck {
    let detail = match config.llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let present = config
                .llm
                .api_key
                .as_ref()
                .map(|key| !key.expose_secret().trim().is_empty())
                .unwrap_or(false);
            if !present {
                return DoctorCheck {
                    name: "oracle".to_string(),
                    status: "error".to_string(),
                    detail: "api key missing for configured provider".to_string(),
                };
            }
            format!("{:?} credentials present", config.llm.provider)
        }
        LlmProvider::Ollama => {
            format!(
                "ollama at {}",
                config.llm.base_url.as_deref().unwrap_or("(unset)")
            )
        }
    };
    DoctorCheck { name: "oracle".to_string(), status: "ok".to_string(), detail }
}

fn check_database(config: &AppConfig) -> DoctorCheck {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "database".to_string(),
                status: "error".to_string(),
                detail: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await?;
        sqlx_ping(&pool).await?;
        pool.close().await;
        Ok::<(), sqlx::Error>(())
    });

    match result {
        Ok(()) => DoctorCheck {
            name: "database".to_string(),
            status: "ok".to_string(),
            detail: format!("connected to {}", config.database.url),
        },
        Err(error) => DoctorCheck {
            name: "database".to_string(),
            status: "error".to_string(),
            detail: error.to_string(),
        },
    }
}

async fn sqlx_ping(pool: &clerky_db::DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = vec![format!("doctor: {}", report.status)];
    for check in &report.checks {
        lines.push(format!("  [{}] {} - {}", check.status, check.name, check.detail));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::run;

    #[test]
    fn doctor_emits_json_when_requested() {
        let output = run(true);
        let parsed: serde_json::Value =
            serde_json::from_str(&output).expect("doctor output should be JSON");
        assert!(parsed.get("status").is_some());
        assert!(parsed.get("checks").and_then(|c| c.as_array()).is_some());
    }
}
