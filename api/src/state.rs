use sqlx::PgPool;

use crate::analysis::AnalysisService;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub analysis: AnalysisService,
}
