use clap::{Parser, Subcommand};
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use engram::codec::{Codec, DeflateCodec};
use engram::memory::types::{MemoryRecord, RecordState};
use engram::session::SessionId;
use engram::storage::DurableStore;

use crate::error::CliResult;
use crate::output::{OutputFormat, format_timestamp, truncate_string};

#[derive(Parser)]
pub struct SessionsCommand {
    #[clap(subcommand)]
    pub command: SessionsSubcommand,
}

#[derive(Subcommand)]
pub enum SessionsSubcommand {
    #[clap(about = "List stored sessions, most recent first")]
    List(ListArgs),

    #[clap(about = "Show the memory records of a session")]
    Show(ShowArgs),

    #[clap(about = "Delete a session and its records")]
    Delete(DeleteArgs),
}

#[derive(Parser)]
pub struct ListArgs {
    #[clap(
        long,
        short,
        default_value = "20",
        help = "Maximum number of sessions to display"
    )]
    pub limit: usize,
}

#[derive(Parser)]
pub struct ShowArgs {
    #[clap(help = "Session ID")]
    pub id: String,

    #[clap(long, help = "Decode and print each record's text")]
    pub decode: bool,
}

#[derive(Parser)]
pub struct DeleteArgs {
    #[clap(help = "Session ID to delete")]
    pub id: String,
}

impl SessionsCommand {
    pub async fn execute(
        &self,
        store: &dyn DurableStore,
        format: OutputFormat,
    ) -> CliResult<String> {
        match &self.command {
            SessionsSubcommand::List(args) => Self::list(store, args, format).await,
            SessionsSubcommand::Show(args) => Self::show(store, args, format).await,
            SessionsSubcommand::Delete(args) => Self::delete(store, args, format).await,
        }
    }

    async fn list(
        store: &dyn DurableStore,
        args: &ListArgs,
        format: OutputFormat,
    ) -> CliResult<String> {
        let mut sessions = store.list_sessions().await?;
        let total = sessions.len();
        sessions.truncate(args.limit);

        match format {
            OutputFormat::Json => {
                let output: Vec<_> = sessions
                    .iter()
                    .map(|m| {
                        serde_json::json!({
                            "session_id": m.session_id.as_str(),
                            "title": &m.title,
                            "preview": &m.preview,
                            "turn_counter": m.turn_counter,
                            "total_stores": m.metrics.total_stores,
                            "reabsorbs": m.metrics.reabsorbs,
                            "last_updated": m.last_updated.to_rfc3339(),
                        })
                    })
                    .collect();
                Ok(serde_json::to_string_pretty(&output)?)
            }
            OutputFormat::Table => {
                if sessions.is_empty() {
                    return Ok("No sessions found.".to_string());
                }

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["ID", "Title", "Turns", "Stores", "Reabsorbs", "Updated"]);

                for meta in &sessions {
                    table.add_row([
                        truncate_string(meta.session_id.as_str(), 12),
                        truncate_string(&meta.title, 40),
                        meta.turn_counter.to_string(),
                        meta.metrics.total_stores.to_string(),
                        meta.metrics.reabsorbs.to_string(),
                        format_timestamp(&meta.last_updated),
                    ]);
                }

                Ok(format!("{table}\n\nTotal: {total} sessions"))
            }
        }
    }

    async fn show(
        store: &dyn DurableStore,
        args: &ShowArgs,
        format: OutputFormat,
    ) -> CliResult<String> {
        let id = SessionId::try_from(args.id.as_str())?;
        let meta = store
            .load_session_meta(&id)
            .await?
            .ok_or_else(|| format!("Session not found: {}", args.id))?;
        let records = store.load_records(&id).await?;

        let codec = DeflateCodec::default();
        let texts: Vec<Option<String>> = records
            .iter()
            .map(|r| args.decode.then(|| decode_or_marker(&codec, r)))
            .collect();

        match format {
            OutputFormat::Json => {
                let rows: Vec<_> = records
                    .iter()
                    .zip(&texts)
                    .map(|(r, text)| {
                        let mut row = serde_json::json!({
                            "id": r.id,
                            "title": &r.title,
                            "tokens": r.original_length,
                            "grade": r.grade,
                            "state": r.state,
                            "created_at_turn": r.created_at_turn,
                            "compression_ratio": r.compression_ratio(),
                        });
                        if let Some(text) = text {
                            row["text"] = serde_json::Value::String(text.clone());
                        }
                        row
                    })
                    .collect();
                let output = serde_json::json!({
                    "session_id": meta.session_id.as_str(),
                    "title": &meta.title,
                    "turn_counter": meta.turn_counter,
                    "metrics": &meta.metrics,
                    "records": rows,
                });
                Ok(serde_json::to_string_pretty(&output)?)
            }
            OutputFormat::Table => {
                let mut out = format!(
                    "Session: {}\nTitle:   {}\nTurns:   {}\nStores:  {} ({} skipped)\nSaved:   {} chars ({:.1}x)\n",
                    meta.session_id,
                    meta.title,
                    meta.turn_counter,
                    meta.metrics.total_stores,
                    meta.metrics.total_skipped(),
                    meta.metrics.total_chars_saved,
                    meta.metrics.expansion_ratio(),
                );

                if records.is_empty() {
                    out.push_str("\nNo records stored.");
                    return Ok(out);
                }

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["#", "Title", "Tokens", "Grade", "State", "Ratio"]);
                for record in &records {
                    table.add_row([
                        record.id.to_string(),
                        truncate_string(&record.title, 40),
                        record.original_length.to_string(),
                        record.grade.to_string(),
                        state_label(record.state).to_string(),
                        format!("{:.1}x", record.compression_ratio()),
                    ]);
                }
                out.push('\n');
                out.push_str(&table.to_string());

                for (record, text) in records.iter().zip(&texts) {
                    if let Some(text) = text {
                        out.push_str(&format!("\n\n[{}] {}\n{}", record.id, record.title, text));
                    }
                }
                Ok(out)
            }
        }
    }

    async fn delete(
        store: &dyn DurableStore,
        args: &DeleteArgs,
        format: OutputFormat,
    ) -> CliResult<String> {
        let id = SessionId::try_from(args.id.as_str())?;
        let deleted = store.delete_session(&id).await?;
        if !deleted {
            return Err(format!("Session not found: {}", args.id).into());
        }

        match format {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(&serde_json::json!({
                "deleted": true,
                "session_id": args.id,
            }))?),
            OutputFormat::Table => Ok(format!("Deleted session: {}", args.id)),
        }
    }
}

fn decode_or_marker(codec: &DeflateCodec, record: &MemoryRecord) -> String {
    codec
        .decode(&record.encoded_payload)
        .unwrap_or_else(|e| format!("<undecodable: {e}>"))
}

fn state_label(state: RecordState) -> &'static str {
    match state {
        RecordState::Active => "active",
        RecordState::Reinjected => "reinjected",
    }
}
