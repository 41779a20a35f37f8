use thiserror::Error;

use crate::bits::Operator;

/// Faults in the edge/worker wire protocol and in batch bookkeeping.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown operator '{0}', expected 'and' or 'or'")]
    UnknownOperator(String),

    #[error("invalid operand: {0}")]
    InvalidOperand(#[from] BitStringError),

    #[error("malformed job line '{0}', expected operator,operand1,operand2")]
    MalformedJob(String),

    #[error("batch size {0} is outside 1..={max}", max = crate::job::MAX_BATCH_SIZE)]
    BatchSizeOutOfRange(usize),

    #[error("job restated batch size {found}, session started with {expected}")]
    BatchSizeMismatch { expected: usize, found: usize },

    #[error("batch already holds {0} jobs")]
    BatchFull(usize),

    #[error("{operator} cohort index {index} is out of range for cohort of {size}")]
    CohortIndexOutOfRange {
        operator: Operator,
        index: usize,
        size: usize,
    },

    #[error("{operator} cohort index {index} already has a result")]
    DuplicateResult { operator: Operator, index: usize },

    #[error("cohort size {0} is outside 1..={max}", max = crate::job::MAX_BATCH_SIZE)]
    CohortSizeOutOfRange(usize),

    #[error("cohort item {0} was already received")]
    DuplicateItem(usize),

    #[error("cohort size {found} disagrees with {expected} from earlier items")]
    CohortSizeMismatch { expected: usize, found: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BitStringError {
    #[error("bit-string is empty")]
    Empty,

    #[error("bit-string '{0}' is longer than {max} digits", max = crate::bits::MAX_BITS)]
    TooLong(String),

    #[error("bit-string '{0}' contains characters other than '0' and '1'")]
    InvalidDigit(String),
}
