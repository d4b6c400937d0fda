//! Batch inference over a folder of CT volumes.
//!
//! Cases run one at a time. With `num_workers > 0` a loader thread reads and
//! preprocesses upcoming cases into a bounded queue while the current case is
//! segmented.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};

use crate::config::{Config, DEFAULT_CONFIG_PATH, EmphysemaEncoding};
use crate::error::CaseError;
use crate::inference::{Inferer, SlidingWindow};
use crate::model::{OnnxUnet, SegmentationModel};
use crate::postprocess::postprocess;
use crate::preprocess::{PreparedVolume, Preprocessor};
use crate::render::save_overlays;
use crate::resample::{ImageResampler, Interpolation, RegResample, ResampleStatus};
use crate::startup::raise_open_file_limit;
use crate::transforms::intensity::Window;
use crate::utils::{NIFTI_GZ, case_id, ensure_output_folder, list_volumes};
use crate::volume::CtImage;
use crate::writer::{IntermediateFile, write_label_map};

#[derive(Args, Debug)]
pub struct InferArgs {
    /// YAML run configuration
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Also derive the emphysema mask inside the lobes
    #[arg(long)]
    pub emp: bool,

    /// Render coronal, axial and sagittal overlay PNGs
    #[arg(long)]
    pub vis: bool,
}

/// One input volume and where its results go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Case {
    pub id: String,
    pub input: PathBuf,
    /// Final label map on the native grid.
    pub output: PathBuf,
    /// Label map written before native resampling; removed afterwards.
    pub intermediate: PathBuf,
}

impl Case {
    pub fn new(id: &str, input: PathBuf, seg_dir: &Path) -> Self {
        Self {
            id: id.to_string(),
            input,
            output: seg_dir.join(format!("{id}{NIFTI_GZ}")),
            intermediate: seg_dir.join(format!("{id}_lobe{NIFTI_GZ}")),
        }
    }

    /// A case is done once its final output exists.
    pub fn is_done(&self) -> bool {
        self.output.exists()
    }
}

/// Every `*.nii.gz` in `data_dir`, sorted by name.
pub fn discover_cases(data_dir: &Path, seg_dir: &Path) -> Result<Vec<Case>> {
    Ok(list_volumes(data_dir)?
        .into_iter()
        .filter_map(|input| {
            let id = case_id(&input)?;
            Some(Case::new(&id, input, seg_dir))
        })
        .collect())
}

#[derive(Debug)]
pub enum CaseOutcome {
    Completed,
    /// Output already existed.
    Skipped,
    Failed(CaseError),
}

#[derive(Debug)]
pub struct CaseReport {
    pub id: String,
    pub outcome: CaseOutcome,
}

/// Outcome of every case in a batch, in processing order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub cases: Vec<CaseReport>,
}

impl BatchReport {
    fn count(&self, predicate: impl Fn(&CaseOutcome) -> bool) -> usize {
        self.cases.iter().filter(|c| predicate(&c.outcome)).count()
    }

    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Completed))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Failed(_)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &CaseError)> {
        self.cases.iter().filter_map(|c| match &c.outcome {
            CaseOutcome::Failed(e) => Some((c.id.as_str(), e)),
            _ => None,
        })
    }

    pub fn print_summary(&self) {
        println!("\n✓ Completed: {}", self.completed());
        println!("  Skipped: {}", self.skipped());
        if self.failed() > 0 {
            println!("✗ Failed: {}", self.failed());
            for (id, error) in self.failures() {
                println!("  ✗ {id} [{}]: {error}", error.stage());
            }
        }
    }
}

/// Optional outputs requested on the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub emphysema: bool,
    pub visualize: bool,
}

impl From<&InferArgs> for RunOptions {
    fn from(args: &InferArgs) -> Self {
        Self {
            emphysema: args.emp,
            visualize: args.vis,
        }
    }
}

struct LoadedCase {
    image: CtImage,
    prepared: PreparedVolume,
}

fn load_case(preprocessor: &Preprocessor, case: &Case) -> Result<LoadedCase, CaseError> {
    let image = CtImage::open(&case.input).map_err(CaseError::Load)?;
    let prepared = preprocessor
        .prepare(image.volume())
        .map_err(CaseError::Preprocess)?;
    Ok(LoadedCase { image, prepared })
}

/// Everything needed to turn a case into a final label map.
pub struct Pipeline<M, I, R> {
    model: M,
    inferer: I,
    resampler: R,
    preprocessor: Preprocessor,
    emp_threshold: Option<f32>,
    emp_encoding: EmphysemaEncoding,
    clip_dir: Option<PathBuf>,
    vis_window: Window,
    prefetch: usize,
}

impl<M, I, R> Pipeline<M, I, R>
where
    M: SegmentationModel,
    I: Inferer,
    R: ImageResampler,
{
    pub fn new(config: &Config, options: RunOptions, model: M, inferer: I, resampler: R) -> Self {
        Self {
            model,
            inferer,
            resampler,
            preprocessor: Preprocessor::from_config(config),
            emp_threshold: options.emphysema.then_some(config.emp_threshold),
            emp_encoding: config.emp_encoding,
            clip_dir: options.visualize.then(|| config.clip_dir.clone()),
            vis_window: config.display_window(),
            prefetch: config.num_workers,
        }
    }

    /// Process every case not yet done. A failing case never stops the batch.
    pub fn run(&self, cases: &[Case]) -> BatchReport {
        let mut report = BatchReport::default();
        let mut pending = Vec::new();
        for case in cases {
            if case.is_done() {
                info!("Skipping {}: {:?} exists", case.id, case.output);
                report.cases.push(CaseReport {
                    id: case.id.clone(),
                    outcome: CaseOutcome::Skipped,
                });
            } else {
                pending.push(case);
            }
        }
        if pending.is_empty() {
            return report;
        }

        let pb = progress_bar(pending.len());
        let mut record = |case: &Case, loaded: Result<LoadedCase, CaseError>| {
            pb.set_message(case.id.clone());
            let outcome = self.finish(case, loaded);
            report.cases.push(CaseReport {
                id: case.id.clone(),
                outcome,
            });
            pb.inc(1);
        };

        if self.prefetch == 0 {
            for &case in &pending {
                record(case, load_case(&self.preprocessor, case));
            }
        } else {
            let preprocessor = self.preprocessor;
            let queue = &pending;
            thread::scope(|scope| {
                let (tx, rx) = mpsc::sync_channel(self.prefetch);
                scope.spawn(move || {
                    for &case in queue {
                        if tx.send(load_case(&preprocessor, case)).is_err() {
                            break;
                        }
                    }
                });
                for (&case, loaded) in pending.iter().zip(rx) {
                    record(case, loaded);
                }
            });
        }
        pb.finish_and_clear();
        report
    }

    fn finish(&self, case: &Case, loaded: Result<LoadedCase, CaseError>) -> CaseOutcome {
        let started = Instant::now();
        info!("Processing {}", case.id);
        match loaded.and_then(|loaded| self.process(case, loaded)) {
            Ok(()) => {
                info!("Finished {} in {:.1}s", case.id, started.elapsed().as_secs_f64());
                CaseOutcome::Completed
            }
            Err(e) => {
                warn!("Case {} failed at {}: {e}", case.id, e.stage());
                CaseOutcome::Failed(e)
            }
        }
    }

    fn process(&self, case: &Case, loaded: LoadedCase) -> Result<(), CaseError> {
        let LoadedCase { image, prepared } = loaded;
        let logits = self
            .inferer
            .infer(prepared.tensor.view(), &self.model)
            .map_err(CaseError::Inference)?;
        let labels = postprocess(&logits, &prepared.geometry, &image, self.emp_threshold)
            .map_err(CaseError::Postprocess)?;
        drop(logits);

        let intermediate = IntermediateFile::new(case.intermediate.clone());
        write_label_map(intermediate.path(), image.header(), &labels, self.emp_encoding)
            .map_err(CaseError::Write)?;
        if let Some(dir) = &self.clip_dir {
            save_overlays(dir, &case.id, &image, &labels.merged(), self.vis_window)
                .map_err(CaseError::Write)?;
        }

        let status = self
            .resampler
            .resample(&case.input, intermediate.path(), &case.output, Interpolation::Nearest)
            .map_err(|e| CaseError::Resample(format!("{e:#}")))?;
        let failure = match status {
            ResampleStatus::Completed if case.output.exists() => return Ok(()),
            ResampleStatus::Completed => "resampler reported success but wrote no output".to_string(),
            ResampleStatus::Failed { code, stderr } => match code {
                Some(code) => format!("exit code {code}: {stderr}"),
                None => format!("terminated by signal: {stderr}"),
            },
        };

        // A stale output would make the next run skip this case.
        if case.output.exists() {
            if let Err(e) = fs::remove_file(&case.output) {
                warn!("Failed to remove partial output {:?}: {e}", case.output);
            }
        }
        Err(CaseError::Resample(failure))
    }
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar().template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}") {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Run the `infer` command.
pub fn run(args: &InferArgs) -> Result<BatchReport> {
    let config = Config::load(&args.config)?;
    match raise_open_file_limit(config.open_files) {
        Ok(limit) => info!("Open file limit: {}", limit.current),
        Err(e) => warn!("{e:#}"),
    }

    ensure_output_folder(&config.seg_dir)?;
    if args.vis {
        ensure_output_folder(&config.clip_dir)?;
    }
    let cases = discover_cases(&config.data_dir, &config.seg_dir)
        .with_context(|| format!("Failed to list cases in {:?}", config.data_dir))?;
    if cases.is_empty() {
        println!("No {NIFTI_GZ} files found in {:?}", config.data_dir);
        return Ok(BatchReport::default());
    }
    let done = cases.iter().filter(|c| c.is_done()).count();
    println!("Found {} case(s), {done} already segmented", cases.len());

    let report = if done == cases.len() {
        BatchReport {
            cases: cases
                .iter()
                .map(|c| CaseReport {
                    id: c.id.clone(),
                    outcome: CaseOutcome::Skipped,
                })
                .collect(),
        }
    } else {
        let model = OnnxUnet::load(&config.model_path, config.sw_batch_size, config.roi_size)?;
        let pipeline = Pipeline::new(
            &config,
            RunOptions::from(args),
            model,
            SlidingWindow::from_config(&config),
            RegResample::new(&config.reg_resample),
        );
        pipeline.run(&cases)
    };

    report.print_summary();
    Ok(report)
}
