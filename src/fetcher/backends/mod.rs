// Fetcher backends

pub mod cobalt;
pub mod iplayer;
pub mod ytdlp;

pub use cobalt::CobaltFetcher;
pub use iplayer::IPlayerFetcher;
pub use ytdlp::YtDlpFetcher;
