use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{ensure, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use med_classify::{
    annotated_output_path, collect_image_files, ClassificationService, Config, OrtModelFactory,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ort=warn")),
        )
        .with_target(false)
        .init();

    let config = Config::parse();
    config.validate()?;
    ensure!(
        config.assets_dir.exists(),
        "Assets directory does not exist: {}",
        config.assets_dir.display()
    );

    let image_paths = collect_image_files(&config.inputs)?;
    ensure!(!image_paths.is_empty(), "No input images found");

    if let Some(dir) = &config.annotated_output {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
    }

    let service = ClassificationService::new(OrtModelFactory, config.clone())?
        .with_ready_callback(|| debug!("ready for next image"));

    let progress_bar = ProgressBar::new(image_paths.len() as u64);
    progress_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec} {eta})",
        )?
        .progress_chars("#>-"),
    );

    let mut written = HashSet::new();
    for path in &image_paths {
        match classify_file(&service, path, &config, &mut written).await {
            Ok(Some(label)) => progress_bar.println(format!("{}: {}", path.display(), label)),
            Ok(None) => progress_bar.println(format!("{}: skipped", path.display())),
            Err(e) => progress_bar.println(format!("{}: error: {:#}", path.display(), e)),
        }
        progress_bar.inc(1);
    }

    progress_bar.finish();
    service.close();

    Ok(())
}

async fn classify_file(
    service: &ClassificationService<OrtModelFactory>,
    path: &Path,
    config: &Config,
    written: &mut HashSet<PathBuf>,
) -> Result<Option<String>> {
    let image = image::open(path)
        .with_context(|| format!("Failed to open image: {}", path.display()))?;

    let Some(report) = service.analyze_image(&image).await? else {
        return Ok(None);
    };

    if let Some(dir) = &config.annotated_output {
        let output_path = annotated_output_path(path, &config.inputs, dir);
        ensure!(
            written.insert(output_path.clone()),
            "Annotated output {} already written for another input",
            output_path.display()
        );
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create output directory: {}", parent.display())
            })?;
        }
        report
            .annotated
            .save(&output_path)
            .with_context(|| format!("Failed to save image: {}", output_path.display()))?;
    }

    Ok(Some(report.label))
}
