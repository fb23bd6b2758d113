use serde_json::json;

/// Process exit codes shared by every command.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const CLIENT_ERROR: i32 = 1;
    pub const SERVER_ERROR: i32 = 2;
    pub const CONNECTION_ERROR: i32 = 3;
    pub const USAGE_ERROR: i32 = 4;
    pub const WAIT_TIMEOUT: i32 = 5;
}

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

pub fn print_json(value: &serde_json::Value, to_stderr: bool) {
    let formatted = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    if to_stderr {
        eprintln!("{formatted}");
    } else {
        println!("{formatted}");
    }
}

pub fn exit_error(message: &str, docs_hint: Option<&str>) -> ! {
    let mut err = json!({
        "error": "cli_error",
        "message": message
    });
    if let Some(hint) = docs_hint {
        err["docs_hint"] = json!(hint);
    }
    print_json(&err, true);
    std::process::exit(exit::USAGE_ERROR);
}

/// Resolve the Bearer token from `COACH_API_KEY`.
pub fn resolve_token() -> Result<String, String> {
    match std::env::var("COACH_API_KEY") {
        Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
        _ => Err("No API key found. Set COACH_API_KEY to a coach_sk_... key.".to_string()),
    }
}

pub fn exit_code_for_status(status: u16) -> i32 {
    match status {
        200..=299 => exit::SUCCESS,
        400..=499 => exit::CLIENT_ERROR,
        _ => exit::SERVER_ERROR,
    }
}

pub fn connection_error(err: &reqwest::Error) -> i32 {
    print_json(
        &json!({
            "error": "connection_error",
            "message": format!("{err}"),
            "docs_hint": "Is the API server running? Check COACH_API_URL."
        }),
        true,
    );
    exit::CONNECTION_ERROR
}

/// Send a request and return the status with its JSON body (no printing).
pub async fn raw_api_request(
    api_url: &str,
    method: reqwest::Method,
    path: &str,
    token: Option<&str>,
    body: Option<&serde_json::Value>,
    extra_headers: &[(String, String)],
) -> Result<(u16, serde_json::Value), reqwest::Error> {
    let mut req = client().request(method, format!("{api_url}{path}"));
    if let Some(t) = token {
        req = req.header("Authorization", format!("Bearer {t}"));
    }
    for (k, v) in extra_headers {
        req = req.header(k.as_str(), v.as_str());
    }
    if let Some(b) = body {
        req = req.json(b);
    }

    let resp = req.send().await?;
    let status = resp.status().as_u16();
    let body = resp
        .json()
        .await
        .unwrap_or_else(|e| json!({"raw_error": format!("Failed to parse response as JSON: {e}")}));
    Ok((status, body))
}

/// Execute an API request, print the response body, return a structured exit code.
///
/// Exit codes: 0=success (2xx), 1=client error (4xx), 2=server error (5xx),
///             3=connection error
pub async fn api_request(
    api_url: &str,
    method: reqwest::Method,
    path: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
    extra_headers: &[(String, String)],
) -> i32 {
    match raw_api_request(api_url, method, path, token, body.as_ref(), extra_headers).await {
        Ok((status, body)) => {
            let code = exit_code_for_status(status);
            print_json(&body, code != exit::SUCCESS);
            code
        }
        Err(e) => connection_error(&e),
    }
}

/// Read JSON from a file path or stdin (when path is "-").
pub fn read_json_from_file(path: &str) -> Result<serde_json::Value, String> {
    let raw = if path == "-" {
        std::io::read_to_string(std::io::stdin())
            .map_err(|e| format!("Failed to read stdin: {e}"))?
    } else {
        std::fs::read_to_string(path).map_err(|e| format!("Failed to read file '{path}': {e}"))?
    };
    serde_json::from_str(&raw).map_err(|e| format!("Invalid JSON in '{path}': {e}"))
}
