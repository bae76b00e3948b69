use clap::Parser;
use dandi_search_text::{NormalizedRecord, NormalizerConfig, RecordNormalizer};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io::{self, Read};

/// Normalize raw archive metadata (one JSON object or an array of objects)
/// into the records the search engine ingests.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input JSON file. If not provided, reads from stdin.
    #[arg(short, long)]
    input: Option<String>,

    /// Maximum length of the normalized text, in characters.
    #[arg(short, long, default_value_t = 8192)]
    max_text_chars: usize,

    /// Comma-separated list of dotted field paths to use as searchable text.
    /// Defaults to the archive's standard descriptive fields.
    #[arg(short, long, value_delimiter = ',')]
    text_fields: Option<Vec<String>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Outcome {
    Ok(NormalizedRecord),
    Err { error: String },
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    let content = if let Some(input_path) = args.input {
        fs::read_to_string(input_path)?
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    };

    let raw: Value = serde_json::from_str(&content)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut config = NormalizerConfig {
        max_text_chars: args.max_text_chars,
        ..NormalizerConfig::default()
    };
    if let Some(fields) = args.text_fields {
        config.text_fields = fields;
    }
    let normalizer = RecordNormalizer::new(config);

    let documents = match raw {
        Value::Array(items) => items,
        other => vec![other],
    };

    let outcomes: Vec<Outcome> = documents
        .iter()
        .map(|doc| match normalizer.normalize(doc) {
            Ok(record) => Outcome::Ok(record),
            Err(e) => Outcome::Err {
                error: e.to_string(),
            },
        })
        .collect();

    let json_output = serde_json::to_string_pretty(&outcomes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    println!("{json_output}");

    Ok(())
}
