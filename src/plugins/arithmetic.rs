//! `arithmetic.add`: adds two numbers with an external executable
//!
//! The executable receives `-in aiida.in`, where the input file holds
//! "x y\n", and prints the sum on stdout.

use crate::calcjob::{
    BuildError, CalcJobPlugin, CommandDescriptor, InputPort, InputSpec, RetrieveEntry,
    StagingArea, ValidatedInputs, ValueKind, CODE_LINK,
};

pub const INPUT_FILE: &str = "aiida.in";
pub const OUTPUT_FILE: &str = "aiida.out";

const NUMERIC: &[ValueKind] = &[ValueKind::Int, ValueKind::Float];

#[derive(Debug, Default)]
pub struct ArithmeticAdd;

impl CalcJobPlugin for ArithmeticAdd {
    fn name(&self) -> &str {
        "arithmetic.add"
    }

    fn spec(&self) -> InputSpec {
        InputSpec::new()
            .required(InputPort::new(CODE_LINK, &[ValueKind::Code]).help("Code that adds two numbers"))
            .required(InputPort::new("x", NUMERIC).help("Left operand"))
            .required(InputPort::new("y", NUMERIC).help("Right operand"))
    }

    fn write_inputs(&self, staging: &StagingArea, inputs: &ValidatedInputs) -> Result<(), BuildError> {
        let x = inputs.number("x")?;
        let y = inputs.number("y")?;
        staging
            .write(INPUT_FILE, format!("{} {}\n", x, y))
            .map_err(|e| BuildError::writer(self.name(), e))?;
        Ok(())
    }

    fn command(&self, job_id: &str, inputs: &ValidatedInputs) -> Result<CommandDescriptor, BuildError> {
        Ok(CommandDescriptor::builder(job_id, inputs.code(CODE_LINK)?)
            .args(["-in", INPUT_FILE])
            .stdout(OUTPUT_FILE)
            .build())
    }

    fn retrieve_list(&self, _inputs: &ValidatedInputs) -> Vec<RetrieveEntry> {
        vec![RetrieveEntry::required(OUTPUT_FILE)]
    }
}
