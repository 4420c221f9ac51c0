use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    ArgumentParse(#[from] clap::Error),
    #[error(transparent)]
    Pipeline(#[from] cairn_engine::PipelineError),
    #[error(transparent)]
    Report(#[from] cairn_report::ReportError),
}
