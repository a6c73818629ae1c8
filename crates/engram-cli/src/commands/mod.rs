pub mod codec_test;
pub mod sessions;
pub mod stats;

pub use codec_test::CodecTestCommand;
pub use sessions::SessionsCommand;
pub use stats::StatsCommand;
