use std::io::Read;

use clap::Parser;
use engram::codec::{Codec, DeflateCodec};
use engram::memory::count_tokens;

use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct CodecTestCommand {
    #[clap(help = "Text to encode (reads stdin when omitted)")]
    pub text: Option<String>,

    #[clap(long, default_value = "6", help = "Compression level (0-9)")]
    pub level: u32,
}

impl CodecTestCommand {
    pub fn execute(&self, format: OutputFormat) -> CliResult<String> {
        let text = match &self.text {
            Some(text) => text.clone(),
            None => {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            }
        };
        self.report(&text, format)
    }

    fn report(&self, text: &str, format: OutputFormat) -> CliResult<String> {
        let codec = DeflateCodec::new(self.level);
        let encoded = codec.encode(text)?;
        let decoded = codec.decode(&encoded)?;
        if decoded != text {
            return Err("Round trip mismatch".into());
        }

        let original = text.len();
        let ratio = if encoded.is_empty() {
            1.0
        } else {
            original as f64 / encoded.len() as f64
        };

        match format {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(&serde_json::json!({
                "level": codec.level(),
                "tokens": count_tokens(text),
                "original_bytes": original,
                "encoded_bytes": encoded.len(),
                "compression_ratio": ratio,
                "round_trip": true,
            }))?),
            OutputFormat::Table => Ok(format!(
                "Level:     {}\nTokens:    {}\nOriginal:  {} bytes\nEncoded:   {} bytes\nRatio:     {:.2}x\nRound trip OK",
                codec.level(),
                count_tokens(text),
                original,
                encoded.len(),
                ratio
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repetitive_text_compresses() {
        let text = "the same sentence again. ".repeat(40);
        let command = CodecTestCommand {
            text: Some(text.clone()),
            level: 9,
        };
        let out = command.execute(OutputFormat::Json).unwrap();

        let json: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(json["original_bytes"], text.len());
        assert_eq!(json["round_trip"], true);
        assert!(json["compression_ratio"].as_f64().unwrap() > 1.0);
    }

    #[test]
    fn test_table_output() {
        let command = CodecTestCommand {
            text: Some("hello world".to_string()),
            level: 6,
        };
        let out = command.execute(OutputFormat::Table).unwrap();
        assert!(out.contains("Tokens:    2"));
        assert!(out.contains("Round trip OK"));
    }
}
