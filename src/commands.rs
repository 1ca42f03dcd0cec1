use anyhow::Context;
use std::io::Write;
use std::path::Path;

use kanadb::config::{self, StoreConfig};
use kanadb::ui::{self, analyses_table, section, stats_table, success};
use kanadb::{FileReferenceGraph, KanaDb};

fn emit_json(value: serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn write_payload(payload: &[u8], out: Option<&Path>) -> anyhow::Result<()> {
    match out {
        Some(path) => {
            std::fs::write(path, payload)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(payload)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

pub async fn run_init(db: &KanaDb, path: &Path, store_config: &StoreConfig, force: bool, json: bool) -> anyhow::Result<()> {
    config::write_config(path, store_config, force)?;
    let analyses = db
        .initialize()
        .await
        .with_context(|| format!("could not open {}", store_config.database.display()))?;

    if json {
        emit_json(serde_json::json!({
            "config": path,
            "database": store_config.database,
            "analyses": analyses.len(),
        }))
    } else {
        success(&format!("Wrote {}", path.display()));
        ui::info("Database", &store_config.database.display().to_string());
        ui::info("Analyses", &analyses.len().to_string());
        Ok(())
    }
}

pub async fn run_list(db: &KanaDb, json: bool) -> anyhow::Result<()> {
    let analyses = db.list_analyses().await?;
    if json {
        return emit_json(serde_json::to_value(&analyses)?);
    }

    if analyses.is_empty() {
        println!("{} No analyses stored.", ui::Icons::EMPTY);
    } else {
        println!("{}", analyses_table(&analyses));
    }
    Ok(())
}

pub async fn run_put_file(db: &KanaDb, path: &Path, id: Option<String>, json: bool) -> anyhow::Result<()> {
    let payload = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let id = id.unwrap_or_else(|| blake3::hash(&payload).to_hex().to_string());

    let count = db.save_file_counted(&id, payload).await?;

    if json {
        emit_json(serde_json::json!({ "id": id, "count": count }))
    } else {
        success(&format!("Stored file {} ({} references)", id, count));
        Ok(())
    }
}

pub async fn run_get_file(db: &KanaDb, id: &str, out: Option<&Path>) -> anyhow::Result<()> {
    let payload = db
        .load_file(id)
        .await?
        .with_context(|| format!("no file stored under {}", id))?;
    write_payload(&payload, out)
}

pub async fn run_rm_file(db: &KanaDb, id: &str, json: bool) -> anyhow::Result<()> {
    db.remove_file(id).await?;
    let remaining = db.file_ref_count(id).await?;

    if json {
        emit_json(serde_json::json!({ "id": id, "count": remaining.unwrap_or(0) }))
    } else {
        match remaining {
            Some(count) => success(&format!("Released file {} ({} references left)", id, count)),
            None => success(&format!("Deleted file {}", id)),
        }
        Ok(())
    }
}

pub async fn run_put_analysis(
    db: &KanaDb,
    path: &Path,
    title: &str,
    files: Option<&Path>,
    id: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let payload = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let graph: FileReferenceGraph = match files {
        Some(files) => {
            let raw = std::fs::read_to_string(files)
                .with_context(|| format!("failed to read {}", files.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("invalid file reference graph in {}", files.display()))?
        }
        None => FileReferenceGraph::new(),
    };

    let references = graph.reference_count();
    let id = db.save_analysis(id, payload, graph, title).await?;

    if json {
        emit_json(serde_json::json!({ "id": id, "references": references }))
    } else {
        success(&format!("Stored analysis {} ({} file references)", id, references));
        Ok(())
    }
}

pub async fn run_get_analysis(db: &KanaDb, id: &str, out: Option<&Path>) -> anyhow::Result<()> {
    let payload = db
        .load_analysis(id)
        .await?
        .with_context(|| format!("no analysis stored under {}", id))?;
    write_payload(&payload, out)
}

pub async fn run_rm_analysis(db: &KanaDb, id: &str, json: bool) -> anyhow::Result<()> {
    let removed = db.remove_analysis(id).await?;
    if json {
        emit_json(serde_json::json!({ "id": id, "removed": removed }))
    } else {
        success(&format!("Removed analysis {}", id));
        Ok(())
    }
}

pub async fn run_show(db: &KanaDb, id: &str, json: bool) -> anyhow::Result<()> {
    let meta = db
        .load_analysis_meta(id)
        .await?
        .with_context(|| format!("no analysis stored under {}", id))?;

    let mut counts = Vec::new();
    for file_id in meta.files.file_ids() {
        counts.push((file_id.to_string(), db.file_ref_count(file_id).await?));
    }

    if json {
        let files: Vec<_> = counts
            .iter()
            .map(|(file_id, count)| serde_json::json!({ "id": file_id, "count": count }))
            .collect();
        return emit_json(serde_json::json!({ "analysis": meta, "files": files }));
    }

    section(&format!("Analysis {}", meta.id));
    ui::info("Title", &meta.title);
    ui::info("Saved (ms)", &meta.time.to_string());
    for (name, dataset) in &meta.files.datasets {
        section(&format!("Dataset {}", name));
        for file in &dataset.files {
            let count = counts
                .iter()
                .find(|(file_id, _)| file_id == &file.id)
                .and_then(|(_, count)| *count);
            let label = match count {
                Some(count) => format!("{} references", count),
                None => "missing".to_string(),
            };
            ui::info(&file.id, &label);
        }
    }
    Ok(())
}

pub async fn run_stats(db: &KanaDb, json: bool) -> anyhow::Result<()> {
    let stats = db.stats().await?;
    if json {
        emit_json(serde_json::to_value(&stats)?)
    } else {
        println!("{}", stats_table(&stats));
        Ok(())
    }
}
