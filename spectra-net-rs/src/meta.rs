//! Model metadata record (`model_meta.txt`).
//!
//! Plain text, one attribute per line. The architecture lines look like
//! `fc_filters (100, 100, 100)`: the parser strips `,`, `(` and `)` and keeps
//! every all-digit token in order. Unknown lines are ignored, and a later line
//! for the same attribute replaces an earlier one.

use std::fs;
use std::path::Path;

use crate::error::{SpectraError, SpectraResult};
use crate::network::ArchitectureVariant;
use crate::shape::ArchitectureSpec;

/// File name of the metadata record inside a model directory.
pub const META_FILE_NAME: &str = "model_meta.txt";

/// Parsed contents of a metadata record. Attributes absent from the file stay
/// `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelMeta {
    pub fc_filters: Option<Vec<usize>>,
    pub tconv_dims: Option<Vec<usize>>,
    pub tconv_filters: Option<Vec<usize>>,
    pub variant: Option<ArchitectureVariant>,
}

impl ModelMeta {
    /// Metadata describing `spec` built with `variant`.
    pub fn from_spec(spec: &ArchitectureSpec, variant: ArchitectureVariant) -> Self {
        Self {
            fc_filters: Some(spec.fc_filters.clone()),
            tconv_dims: Some(spec.tconv_dims.clone()),
            tconv_filters: Some(spec.tconv_filters.clone()),
            variant: Some(variant),
        }
    }

    /// Parse metadata text.
    pub fn parse(text: &str) -> Self {
        let mut meta = Self::default();

        for line in text.lines() {
            if line.starts_with("fc_filters") {
                meta.fc_filters = Some(integer_tokens(line));
            } else if line.starts_with("tconv_dims") {
                meta.tconv_dims = Some(integer_tokens(line));
            } else if line.starts_with("tconv_filters") {
                meta.tconv_filters = Some(integer_tokens(line));
            } else if let Some(rest) = line.strip_prefix("variant") {
                meta.variant = rest.trim().parse().ok();
            }
        }

        meta
    }

    /// Read `model_meta.txt` from a model directory.
    pub fn read(model_dir: impl AsRef<Path>) -> SpectraResult<Self> {
        let path = model_dir.as_ref().join(META_FILE_NAME);
        let text = fs::read_to_string(&path).map_err(|e| SpectraError::io(&path, e))?;
        Ok(Self::parse(&text))
    }

    /// Convert to a validated [`ArchitectureSpec`].
    ///
    /// # Errors
    ///
    /// Any missing architecture attribute, or an attribute set that does not
    /// form a valid upsampling schedule, is a configuration error.
    pub fn to_spec(&self) -> SpectraResult<ArchitectureSpec> {
        let missing = |name: &str| {
            SpectraError::configuration(format!("model metadata is missing `{name}`"))
        };

        let fc_filters = self.fc_filters.clone().ok_or_else(|| missing("fc_filters"))?;
        let tconv_dims = self.tconv_dims.clone().ok_or_else(|| missing("tconv_dims"))?;
        let tconv_filters = self
            .tconv_filters
            .clone()
            .ok_or_else(|| missing("tconv_filters"))?;

        ArchitectureSpec::new(fc_filters, tconv_dims, tconv_filters)
    }

    /// Render the record.
    pub fn render(&self, input_size: Option<usize>) -> String {
        let mut lines = Vec::new();

        for (name, values) in [
            ("fc_filters", &self.fc_filters),
            ("tconv_dims", &self.tconv_dims),
            ("tconv_filters", &self.tconv_filters),
        ] {
            if let Some(values) = values {
                lines.push(format!("{name} {}", format_tuple(values)));
            }
        }
        if let Some(variant) = self.variant {
            lines.push(format!("variant {variant}"));
        }
        if let Some(input_size) = input_size {
            lines.push(format!("input_size {input_size}"));
        }
        if let Some(output_size) = self.to_spec().ok().and_then(|spec| spec.output_size().ok()) {
            lines.push(format!("output_size {output_size}"));
        }

        lines.into_iter().map(|line| line + "\n").collect()
    }

    /// Write `model_meta.txt` into `model_dir`, creating the directory.
    pub fn write(&self, model_dir: impl AsRef<Path>, input_size: Option<usize>) -> SpectraResult<()> {
        let model_dir = model_dir.as_ref();
        fs::create_dir_all(model_dir).map_err(|e| SpectraError::io(model_dir, e))?;
        let path = model_dir.join(META_FILE_NAME);
        fs::write(&path, self.render(input_size)).map_err(|e| SpectraError::io(&path, e))
    }
}

fn integer_tokens(line: &str) -> Vec<usize> {
    line.replace([',', '(', ')'], " ")
        .split_whitespace()
        .filter(|token| token.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|token| token.parse().ok())
        .collect()
}

fn format_tuple(values: &[usize]) -> String {
    let joined = values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("({joined})")
}
