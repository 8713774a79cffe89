//! CLI smoke entry point.
//!
//! # Responsibility
//! - Provide a minimal executable to verify `folio_core` linkage.
//! - Optionally print the index of one pack stored in a SQLite database:
//!   `folio_cli <db-path> <package>.<pack> <DocumentName>`.
//! - Log to `FOLIO_LOG_DIR` when it is set.

use folio_core::{
    CompendiumMetadata, DocumentType, DocumentTypeRegistry, SqliteBackend, World,
};
use std::process::ExitCode;
use std::sync::Arc;

fn main() -> ExitCode {
    println!("folio_core ping={}", folio_core::ping());
    println!("folio_core version={}", folio_core::core_version());

    if let Ok(log_dir) = std::env::var("FOLIO_LOG_DIR") {
        if let Err(err) = folio_core::init_logging(folio_core::default_log_level(), &log_dir) {
            eprintln!("logging disabled: {err}");
        }
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [db_path, pack_key, document_name] = args.as_slice() else {
        return ExitCode::SUCCESS;
    };
    match print_pack_index(db_path, pack_key, document_name) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn print_pack_index(db_path: &str, pack_key: &str, document_name: &str) -> Result<(), String> {
    let Some((package, name)) = pack_key.split_once('.') else {
        return Err(format!("pack key `{pack_key}` must look like <package>.<pack>"));
    };

    let mut types = DocumentTypeRegistry::new();
    if types.get(document_name).is_none() {
        types
            .register(DocumentType::new(document_name))
            .map_err(|err| err.to_string())?;
    }
    let store = Arc::new(SqliteBackend::open(db_path).map_err(|err| err.to_string())?);
    let world = World::with_sqlite(Arc::new(types), store).map_err(|err| err.to_string())?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|err| err.to_string())?;
    runtime.block_on(async {
        let pack = world
            .register_pack(CompendiumMetadata::new(package, name, document_name))
            .await
            .map_err(|err| err.to_string())?;
        let index = pack.get_index().await.map_err(|err| err.to_string())?;
        println!("pack={} locked={} entries={}", pack.collection(), pack.locked(), index.len());
        for entry in index {
            let id = entry.get("_id").and_then(|v| v.as_str()).unwrap_or("?");
            let label = entry.get("name").and_then(|v| v.as_str()).unwrap_or("");
            println!("{id} {label}");
        }
        log::info!(
            "event=cli_pack_index module=cli status=ok pack={pack_key} count={}",
            pack.index().len()
        );
        Ok::<(), String>(())
    })
}
