//! Bitwise job routing between a client, an edge server and two workers.
//!
//! A client submits a batch of `and`/`or` jobs over two bit-strings. The edge
//! splits the batch into an AND cohort and an OR cohort, sends each item over
//! UDP to the worker for its operator, and puts the replies back in submission
//! order before answering the client. Each module owns one piece:
//!
//! - [`bits`] holds the bit-string type and the AND/OR arithmetic.
//! - [`job`] tracks batch positions and cohort indices for one batch.
//! - [`message`] defines the JSON messages and their TCP and UDP framing.
//! - [`worker`] collects cohorts over UDP, computes and replies.
//! - [`edge`] runs one task per client session and demultiplexes worker
//!   replies by session id.
//! - [`client`] reads a job file, submits it and prints the results.
//! - [`error`] names the protocol and operand faults.
//! - [`cli`] parses the command line for all three roles.

pub mod bits;
pub mod cli;
pub mod client;
pub mod edge;
pub mod error;
pub mod job;
pub mod message;
pub mod worker;
