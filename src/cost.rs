//! Static per-unit cost tables.

use serde::{Deserialize, Serialize};

use crate::error::SubmitError;
use crate::job::JobType;

/// Sub-model used when a submission names none.
pub const DEFAULT_SUB_MODEL: &str = "standard";

struct Tariff {
  max_quantity: u32,
  sub_models: &'static [(&'static str, u64)],
}

const IMAGE: Tariff = Tariff {
  max_quantity: 16,
  sub_models: &[("standard", 1), ("hd", 2), ("ultra", 4)],
};

const VIDEO: Tariff = Tariff {
  max_quantity: 4,
  sub_models: &[("standard", 10), ("pro", 25)],
};

const MODEL_3D: Tariff = Tariff {
  max_quantity: 4,
  sub_models: &[("standard", 15), ("detailed", 30)],
};

const CAD: Tariff = Tariff {
  max_quantity: 8,
  sub_models: &[("standard", 12)],
};

fn tariff(job_type: JobType) -> &'static Tariff {
  match job_type {
    JobType::Image => &IMAGE,
    JobType::Video => &VIDEO,
    JobType::Model3d => &MODEL_3D,
    JobType::Cad => &CAD,
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEstimate {
  pub per_unit: u64,
  pub quantity: u32,
  pub total: u64,
}

/// Prices a submission. Unknown sub-models and quantities outside
/// `1..=max` are validation errors.
pub fn estimate(
  job_type: JobType,
  sub_model: Option<&str>,
  quantity: u32,
) -> Result<CostEstimate, SubmitError> {
  let tariff = tariff(job_type);
  if quantity == 0 || quantity > tariff.max_quantity {
    return Err(SubmitError::Validation(format!(
      "quantity {} out of range 1..={} for {} jobs",
      quantity, tariff.max_quantity, job_type
    )));
  }

  let sub_model = sub_model.unwrap_or(DEFAULT_SUB_MODEL);
  let per_unit = tariff
    .sub_models
    .iter()
    .find(|(name, _)| *name == sub_model)
    .map(|(_, cost)| *cost)
    .ok_or_else(|| {
      SubmitError::Validation(format!("unknown sub-model '{}' for {} jobs", sub_model, job_type))
    })?;

  Ok(CostEstimate {
    per_unit,
    quantity,
    total: per_unit * u64::from(quantity),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn total_scales_with_quantity() {
    let cost = estimate(JobType::Image, Some("hd"), 3).unwrap();
    assert_eq!(cost.per_unit, 2);
    assert_eq!(cost.total, 6);

    let cost = estimate(JobType::Video, None, 2).unwrap();
    assert_eq!(cost.total, 20);
  }

  #[test]
  fn rejects_out_of_range_quantity() {
    assert!(matches!(
      estimate(JobType::Image, None, 0),
      Err(SubmitError::Validation(_))
    ));
    assert!(matches!(
      estimate(JobType::Video, None, 5),
      Err(SubmitError::Validation(_))
    ));
    assert!(estimate(JobType::Image, None, 16).is_ok());
  }

  #[test]
  fn rejects_unknown_sub_model() {
    let err = estimate(JobType::Cad, Some("ultra"), 1).unwrap_err();
    assert_eq!(
      err,
      SubmitError::Validation("unknown sub-model 'ultra' for cad jobs".into())
    );
  }
}
