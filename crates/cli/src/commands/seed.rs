use crate::commands::CommandResult;
use clerky_core::config::{AppConfig, LoadOptions};
use clerky_db::fixtures::{seed_demo_workspace, DEMO_WORKSPACE};
use clerky_db::repositories::{SqlRecordRepository, SqlTableRepository};
use clerky_db::{connect_with_settings, migrations};

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "seed",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "seed",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let tables = SqlTableRepository::new(pool.clone());
        let records = SqlRecordRepository::new(pool.clone());
        seed_demo_workspace(&tables, &records)
            .await
            .map_err(|error| ("seed", error.to_string(), 6u8))?;

        pool.close().await;
        Ok::<(), (&'static str, String, u8)>(())
    });

    match result {
        Ok(()) => CommandResult::success(
            "seed",
            format!("loaded demo fixtures into workspace {DEMO_WORKSPACE}"),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}
