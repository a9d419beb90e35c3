//! Pure mark arithmetic: component validation against a subject's marking
//! scheme, the per-component pass rule, and the transcript division bands.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubjectScheme {
    pub internal_max: i64,
    pub external_max: i64,
    pub internal_passing: i64,
    pub external_passing: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkRejection {
    NegativeMarks,
    InternalExceeded { submitted: i64, max: i64 },
    ExternalExceeded { submitted: i64, max: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkOutcome {
    pub total: i64,
    pub is_pass: bool,
}

/// Validates a submission against the scheme and derives total/pass.
/// Passing is per-component: both internal AND external must meet their
/// thresholds; the aggregate total never grants a pass on its own.
pub fn evaluate(scheme: &SubjectScheme, internal: i64, external: i64) -> Result<MarkOutcome, MarkRejection> {
    if internal < 0 || external < 0 {
        return Err(MarkRejection::NegativeMarks);
    }
    if internal > scheme.internal_max {
        return Err(MarkRejection::InternalExceeded {
            submitted: internal,
            max: scheme.internal_max,
        });
    }
    if external > scheme.external_max {
        return Err(MarkRejection::ExternalExceeded {
            submitted: external,
            max: scheme.external_max,
        });
    }
    Ok(MarkOutcome {
        total: internal + external,
        is_pass: internal >= scheme.internal_passing && external >= scheme.external_passing,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Division {
    First,
    Second,
    Third,
    Fail,
}

impl Division {
    pub fn as_str(self) -> &'static str {
        match self {
            Division::First => "First",
            Division::Second => "Second",
            Division::Third => "Third",
            Division::Fail => "Fail",
        }
    }
}

pub fn percentage(obtained: i64, maximum: i64) -> f64 {
    if maximum > 0 {
        100.0 * obtained as f64 / maximum as f64
    } else {
        0.0
    }
}

/// Division banding for the provisional certificate. A single failed
/// subject fails the transcript regardless of the overall percentage.
pub fn division(percent: f64, any_subject_failed: bool) -> Division {
    if any_subject_failed {
        return Division::Fail;
    }
    if percent >= 60.0 {
        Division::First
    } else if percent >= 50.0 {
        Division::Second
    } else if percent >= 40.0 {
        Division::Third
    } else {
        Division::Fail
    }
}
