//! Batch bookkeeping shared by the edge and the client.
//!
//! A [`Batch`] records each job's position in the submitted batch and its
//! index within its operator's cohort. Worker replies name only the cohort
//! index, so [`Batch::record`] maps `(operator, cohort_index)` back to the
//! batch position and results come out in submission order no matter how
//! replies arrive.

use std::str::FromStr;

use crate::{
    bits::{BitString, Operator},
    error::ProtocolError,
    message::{SessionId, WorkerRequest},
};

/// Largest batch a client may submit.
pub const MAX_BATCH_SIZE: usize = 100;

/// One line of client input: `operator,operand1,operand2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub operator: Operator,
    pub operand1: BitString,
    pub operand2: BitString,
}

impl FromStr for JobSpec {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        let [operator, operand1, operand2] = fields.as_slice() else {
            return Err(ProtocolError::MalformedJob(line.trim().to_string()));
        };

        Ok(Self {
            operator: operator.parse()?,
            operand1: BitString::parse(operand1)?,
            operand2: BitString::parse(operand2)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(BitString),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct Job {
    pub position: usize,
    pub cohort_index: usize,
    pub spec: JobSpec,
    pub outcome: Option<JobOutcome>,
}

/// The ordered jobs of one client session.
#[derive(Debug)]
pub struct Batch {
    expected: usize,
    jobs: Vec<Job>,
    and_cohort: Vec<usize>,
    or_cohort: Vec<usize>,
    pending: usize,
}

impl Batch {
    /// Creates an empty batch that will hold exactly `expected` jobs.
    pub fn with_size(expected: usize) -> Result<Self, ProtocolError> {
        if !(1..=MAX_BATCH_SIZE).contains(&expected) {
            return Err(ProtocolError::BatchSizeOutOfRange(expected));
        }
        Ok(Self {
            expected,
            jobs: Vec::with_capacity(expected),
            and_cohort: Vec::new(),
            or_cohort: Vec::new(),
            pending: 0,
        })
    }

    /// Appends a job, assigning its batch position and cohort index.
    pub fn push(&mut self, spec: JobSpec) -> Result<usize, ProtocolError> {
        if self.is_full() {
            return Err(ProtocolError::BatchFull(self.expected));
        }

        let position = self.jobs.len();
        let cohort = self.cohort_mut(spec.operator);
        let cohort_index = cohort.len();
        cohort.push(position);

        self.jobs.push(Job {
            position,
            cohort_index,
            spec,
            outcome: None,
        });
        self.pending += 1;
        Ok(position)
    }

    pub fn expected_size(&self) -> usize {
        self.expected
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() == self.expected
    }

    pub fn cohort_size(&self, operator: Operator) -> usize {
        self.cohort(operator).len()
    }

    /// Worker requests in ingestion order, so cohort index `k` is always the
    /// `k`-th job of that operator.
    pub fn worker_requests(
        &self,
        session: SessionId,
    ) -> impl Iterator<Item = (Operator, WorkerRequest)> + '_ {
        self.jobs.iter().map(move |job| {
            let operator = job.spec.operator;
            (
                operator,
                WorkerRequest {
                    session,
                    cohort_index: job.cohort_index,
                    cohort_size: self.cohort_size(operator),
                    operand1: job.spec.operand1.clone(),
                    operand2: job.spec.operand2.clone(),
                },
            )
        })
    }

    /// Stores a worker result in the job it belongs to.
    pub fn record(
        &mut self,
        operator: Operator,
        cohort_index: usize,
        result: BitString,
    ) -> Result<usize, ProtocolError> {
        let cohort = self.cohort(operator);
        let position = *cohort
            .get(cohort_index)
            .ok_or(ProtocolError::CohortIndexOutOfRange {
                operator,
                index: cohort_index,
                size: cohort.len(),
            })?;

        let job = &mut self.jobs[position];
        if job.outcome.is_some() {
            return Err(ProtocolError::DuplicateResult {
                operator,
                index: cohort_index,
            });
        }
        job.outcome = Some(JobOutcome::Completed(result));
        self.pending -= 1;
        Ok(position)
    }

    /// Marks every job still waiting for a result as failed.
    pub fn fail_pending(&mut self, reason: &str) -> usize {
        let mut failed = 0;
        for job in self.jobs.iter_mut().filter(|job| job.outcome.is_none()) {
            job.outcome = Some(JobOutcome::Failed(reason.to_string()));
            failed += 1;
        }
        self.pending = 0;
        failed
    }

    /// True once every job has an outcome.
    pub fn is_settled(&self) -> bool {
        self.pending == 0
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    fn cohort(&self, operator: Operator) -> &Vec<usize> {
        match operator {
            Operator::And => &self.and_cohort,
            Operator::Or => &self.or_cohort,
        }
    }

    fn cohort_mut(&mut self, operator: Operator) -> &mut Vec<usize> {
        match operator {
            Operator::And => &mut self.and_cohort,
            Operator::Or => &mut self.or_cohort,
        }
    }
}

/// Parses client input, one job per non-blank line.
pub fn parse_jobs(input: &str) -> anyhow::Result<Vec<JobSpec>> {
    let mut jobs = Vec::new();
    for (line_no, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let spec = line
            .parse::<JobSpec>()
            .map_err(|err| anyhow::anyhow!("line {}: {err}", line_no + 1))?;
        jobs.push(spec);
    }

    anyhow::ensure!(!jobs.is_empty(), "input contains no jobs");
    anyhow::ensure!(
        jobs.len() <= MAX_BATCH_SIZE,
        "input contains {} jobs, at most {MAX_BATCH_SIZE} are allowed",
        jobs.len()
    );
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use rand::seq::SliceRandom;

    use super::*;

    fn spec(line: &str) -> JobSpec {
        line.parse().expect("valid job line")
    }

    fn bs(digits: &str) -> BitString {
        BitString::parse(digits).expect("valid bit-string")
    }

    fn batch_of(lines: &[&str]) -> Batch {
        let mut batch = Batch::with_size(lines.len()).expect("batch size");
        for line in lines {
            batch.push(spec(line)).expect("push job");
        }
        batch
    }

    fn completed(batch: &Batch) -> Vec<String> {
        batch
            .jobs()
            .iter()
            .map(|job| match &job.outcome {
                Some(JobOutcome::Completed(result)) => result.to_string(),
                other => panic!("job {} not completed: {other:?}", job.position),
            })
            .collect()
    }

    #[test]
    fn job_line_parsing() {
        assert_eq!(
            spec(" and, 1010101 ,100 "),
            JobSpec {
                operator: Operator::And,
                operand1: bs("1010101"),
                operand2: bs("100"),
            }
        );
        assert!(matches!(
            "and,1,1,1".parse::<JobSpec>(),
            Err(ProtocolError::MalformedJob(_))
        ));
        assert!(matches!(
            "nand,1,1".parse::<JobSpec>(),
            Err(ProtocolError::UnknownOperator(_))
        ));
        assert!(matches!(
            "or,1,2".parse::<JobSpec>(),
            Err(ProtocolError::InvalidOperand(_))
        ));
    }

    #[test]
    fn positions_and_cohort_indices() {
        let batch = batch_of(&["and,1111,1", "or,0,0", "and,1,1", "or,10,1"]);

        let assigned: Vec<(usize, usize)> = batch
            .jobs()
            .iter()
            .map(|job| (job.position, job.cohort_index))
            .collect();
        assert_eq!(assigned, vec![(0, 0), (1, 0), (2, 1), (3, 1)]);
        assert_eq!(batch.cohort_size(Operator::And), 2);
        assert_eq!(batch.cohort_size(Operator::Or), 2);
    }

    #[test]
    fn worker_requests_carry_cohort_size() {
        let batch = batch_of(&["and,1111,1", "or,0,0", "and,1,1"]);
        let requests: Vec<_> = batch.worker_requests(42).collect();

        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].0, Operator::And);
        assert_eq!(requests[0].1.cohort_size, 2);
        assert_eq!(requests[1].0, Operator::Or);
        assert_eq!(requests[1].1.cohort_size, 1);
        assert_eq!(requests[2].1.cohort_index, 1);
        assert!(requests.iter().all(|(_, request)| request.session == 42));
    }

    #[test]
    fn replies_in_any_order_land_in_batch_order() {
        let lines = ["and,1111,1", "or,0,0", "and,1,1", "or,1000,1", "and,110,011"];
        let mut batch = batch_of(&lines);

        let mut replies: Vec<(Operator, usize, BitString)> = batch
            .worker_requests(1)
            .map(|(operator, request)| {
                let result = operator.apply(&request.operand1, &request.operand2);
                (operator, request.cohort_index, result)
            })
            .collect();
        replies.shuffle(&mut rand::thread_rng());

        for (operator, index, result) in replies {
            batch.record(operator, index, result).expect("record reply");
        }

        assert!(batch.is_settled());
        assert_eq!(completed(&batch), vec!["1", "0", "1", "1001", "10"]);
    }

    #[test]
    fn out_of_range_and_duplicate_replies_are_rejected() {
        let mut batch = batch_of(&["and,1,1", "or,0,1"]);

        assert_eq!(
            batch.record(Operator::Or, 1, bs("1")),
            Err(ProtocolError::CohortIndexOutOfRange {
                operator: Operator::Or,
                index: 1,
                size: 1,
            })
        );
        assert_eq!(batch.record(Operator::And, 0, bs("1")), Ok(0));
        assert_eq!(
            batch.record(Operator::And, 0, bs("1")),
            Err(ProtocolError::DuplicateResult {
                operator: Operator::And,
                index: 0,
            })
        );
        assert!(!batch.is_settled());
    }

    #[test]
    fn fail_pending_settles_missing_jobs() {
        let mut batch = batch_of(&["and,1,1", "or,0,1", "or,1,1"]);
        batch.record(Operator::Or, 1, bs("1")).expect("record");

        assert_eq!(batch.fail_pending("timed out"), 2);
        assert!(batch.is_settled());
        assert_eq!(
            batch.jobs()[0].outcome,
            Some(JobOutcome::Failed("timed out".into()))
        );
        assert_eq!(batch.jobs()[2].outcome, Some(JobOutcome::Completed(bs("1"))));
    }

    #[test]
    fn batch_size_bounds() {
        assert_eq!(
            Batch::with_size(0).unwrap_err(),
            ProtocolError::BatchSizeOutOfRange(0)
        );
        assert!(Batch::with_size(MAX_BATCH_SIZE).is_ok());
        assert!(Batch::with_size(MAX_BATCH_SIZE + 1).is_err());

        let mut batch = batch_of(&["and,1,1"]);
        assert_eq!(
            batch.push(spec("or,1,1")),
            Err(ProtocolError::BatchFull(1))
        );
    }

    #[test]
    fn parse_jobs_skips_blank_lines_and_reports_line_numbers() {
        let jobs = parse_jobs("and,1,1\n\n  \nor,10,01\n").expect("valid input");
        assert_eq!(jobs.len(), 2);

        let err = parse_jobs("and,1,1\nor,1,12345678901\n").unwrap_err();
        assert!(err.to_string().starts_with("line 2:"), "{err}");

        assert!(parse_jobs("\n\n").is_err());
        assert!(parse_jobs(&"and,1,1\n".repeat(MAX_BATCH_SIZE + 1)).is_err());
    }
}
