//! Import pipelines that bring external agent data into the workspace.

pub mod openclaw;
