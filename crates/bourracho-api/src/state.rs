use std::sync::Arc;

use bourracho_db::media::MediaStorage;
use bourracho_sync::Engine;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub engine: Arc<Engine>,
    pub media: MediaStorage,
    pub jwt_secret: String,
}
