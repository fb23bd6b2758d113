use std::time::{Duration, Instant};

use clap::Subcommand;
use serde_json::json;
use uuid::Uuid;

use crate::util::{
    api_request, connection_error, exit, exit_code_for_status, exit_error, print_json,
    raw_api_request, read_json_from_file,
};

const PROVIDER_KEY_HEADER: &str = "x-provider-key";

#[derive(Subcommand)]
pub enum AnalysisCommands {
    /// Submit an analysis job (prints the job id; use `wait` to follow it)
    Submit {
        /// JSON file with the analysis request ('-' for stdin)
        #[arg(long)]
        request_file: String,
        /// Own model provider key; the job then bypasses platform credits
        #[arg(long, env = "COACH_PROVIDER_KEY", hide_env_values = true)]
        provider_key: Option<String>,
    },
    /// Show the current status of a job
    Status {
        #[arg(long)]
        job_id: Uuid,
    },
    /// Poll a job until it completes or fails
    Wait {
        #[arg(long)]
        job_id: Uuid,
        /// Seconds between polls
        #[arg(long, default_value_t = 3)]
        interval_secs: u64,
        /// Give up after this many seconds (exit code 5)
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
}

pub async fn run(api_url: &str, token: Option<&str>, command: AnalysisCommands) -> i32 {
    match command {
        AnalysisCommands::Submit {
            request_file,
            provider_key,
        } => submit(api_url, token, &request_file, provider_key.as_deref()).await,
        AnalysisCommands::Status { job_id } => status(api_url, token, job_id).await,
        AnalysisCommands::Wait {
            job_id,
            interval_secs,
            timeout_secs,
        } => {
            if interval_secs == 0 {
                exit_error("--interval-secs must be at least 1", None);
            }
            wait(
                api_url,
                token,
                job_id,
                Duration::from_secs(interval_secs),
                Duration::from_secs(timeout_secs),
            )
            .await
        }
    }
}

async fn submit(
    api_url: &str,
    token: Option<&str>,
    request_file: &str,
    provider_key: Option<&str>,
) -> i32 {
    let body = match read_json_from_file(request_file) {
        Ok(v) => v,
        Err(e) => exit_error(
            &e,
            Some("Provide a JSON analysis request via --request-file <path> or '-' for stdin"),
        ),
    };

    let headers: Vec<(String, String)> = provider_key
        .map(|key| vec![(PROVIDER_KEY_HEADER.to_string(), key.to_string())])
        .unwrap_or_default();

    api_request(
        api_url,
        reqwest::Method::POST,
        "/v1/analysis/jobs",
        token,
        Some(body),
        &headers,
    )
    .await
}

async fn status(api_url: &str, token: Option<&str>, job_id: Uuid) -> i32 {
    api_request(
        api_url,
        reqwest::Method::GET,
        &format!("/v1/analysis/jobs/{job_id}"),
        token,
        None,
        &[],
    )
    .await
}

/// Exit code for a job body once it is terminal; `None` while still processing.
fn terminal_exit_code(body: &serde_json::Value) -> Option<i32> {
    match body.get("status").and_then(|s| s.as_str()) {
        Some("completed") => Some(exit::SUCCESS),
        Some("failed") => Some(exit::CLIENT_ERROR),
        _ => None,
    }
}

async fn wait(
    api_url: &str,
    token: Option<&str>,
    job_id: Uuid,
    interval: Duration,
    timeout: Duration,
) -> i32 {
    let path = format!("/v1/analysis/jobs/{job_id}");
    let started = Instant::now();

    loop {
        let (status, body) =
            match raw_api_request(api_url, reqwest::Method::GET, &path, token, None, &[]).await {
                Ok(resp) => resp,
                Err(e) => return connection_error(&e),
            };

        let code = exit_code_for_status(status);
        if code != exit::SUCCESS {
            print_json(&body, true);
            return code;
        }

        if let Some(code) = terminal_exit_code(&body) {
            print_json(&body, code != exit::SUCCESS);
            return code;
        }

        if started.elapsed() + interval > timeout {
            print_json(
                &json!({
                    "error": "wait_timeout",
                    "message": format!(
                        "Job {job_id} still processing after {}s",
                        started.elapsed().as_secs()
                    ),
                    "docs_hint": "The job keeps running server-side. Re-run `coach analysis wait` or raise --timeout-secs.",
                    "last_status": body,
                }),
                true,
            );
            return exit::WAIT_TIMEOUT;
        }

        tokio::time::sleep(interval).await;
    }
}
