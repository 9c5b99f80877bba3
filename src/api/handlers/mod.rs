pub mod runs;
pub mod settings;
pub mod stream;
pub mod tasks;

pub async fn health() -> &'static str {
    "ok"
}
