use crate::util::api_request;

/// Show tier, credit balance and whether a new job would be accepted.
pub async fn run(api_url: &str, token: Option<&str>) -> i32 {
    api_request(api_url, reqwest::Method::GET, "/v1/quota", token, None, &[]).await
}
