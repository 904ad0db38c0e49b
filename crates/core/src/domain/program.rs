use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::protocol::Protocol;
use crate::error::{CoreError, Result};

/// A benchmark program, written `<problem>_<size>` on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Program {
    pub problem: String,
    pub size: String,
}

impl Program {
    pub fn new(problem: impl Into<String>, size: impl Into<String>) -> Self {
        Self {
            problem: problem.into(),
            size: size.into(),
        }
    }

    /// Problems over real numbers are homomorphic; everything else is garbled.
    pub fn protocol(&self) -> Protocol {
        if self.problem.starts_with("real") {
            Protocol::Ckks
        } else {
            Protocol::Halfgates
        }
    }

    pub fn name(&self) -> String {
        format!("{}_{}", self.problem, self.size)
    }

    /// Programs run when none are named, for the LAN cluster sizes with a known sweep.
    pub fn defaults_for_lan(num_machines: usize) -> Option<Vec<Program>> {
        let names: &[&str] = match num_machines {
            2 => &[
                "merge_sorted_1048576",
                "full_sort_1048576",
                "loop_join_2048",
                "matrix_vector_multiply_8192",
                "binary_fc_layer_16384",
                "real_sum_65536",
                "real_statistics_16384",
                "real_matrix_vector_multiply_256",
                "real_naive_matrix_multiply_128",
                "real_tiled_matrix_multiply_128",
            ],
            8 => &[
                "merge_sorted_4194304",
                "full_sort_4194304",
                "loop_join_4096",
                "matrix_vector_multiply_16384",
                "binary_fc_layer_32768",
                "real_sum_262144",
                "real_statistics_65536",
                "real_matrix_vector_multiply_512",
                "real_naive_matrix_multiply_256",
                "real_tiled_matrix_multiply_256",
            ],
            _ => return None,
        };
        names.iter().map(|n| n.parse().ok()).collect()
    }
}

impl FromStr for Program {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.rsplit_once('_') {
            Some((problem, size)) if !problem.is_empty() && !size.is_empty() => {
                Ok(Self::new(problem, size))
            }
            _ => Err(CoreError::invalid(format!(
                "program name must be of the form <problem name>_<problem size> (got {})",
                s
            ))),
        }
    }
}

impl std::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.problem, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_on_last_underscore() {
        let program: Program = "matrix_vector_multiply_8192".parse().unwrap();
        assert_eq!(program.problem, "matrix_vector_multiply");
        assert_eq!(program.size, "8192");
        assert_eq!(program.name(), "matrix_vector_multiply_8192");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("mergesorted".parse::<Program>().is_err());
        assert!("merge_".parse::<Program>().is_err());
        assert!("_1024".parse::<Program>().is_err());
    }

    #[test]
    fn test_protocol_inference() {
        assert_eq!(Program::new("real_sum", "64").protocol(), Protocol::Ckks);
        assert_eq!(Program::new("loop_join", "64").protocol(), Protocol::Halfgates);
    }

    #[test]
    fn test_default_programs() {
        assert_eq!(Program::defaults_for_lan(2).unwrap().len(), 10);
        assert_eq!(Program::defaults_for_lan(8).unwrap()[0].size, "4194304");
        assert!(Program::defaults_for_lan(4).is_none());
    }
}
