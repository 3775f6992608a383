// Up-to-date checker
// State machine deciding per run attempt whether a node must execute or can
// reuse its prior record

use std::collections::BTreeMap;
use std::path::Path;

use super::record::{ExecRecord, InputSignature};
use crate::defs::{CheckSpec, DataItem};
use crate::runner::ImplRegistry;
use crate::value::Value;

/// Checker states. Entered at `Unchecked` once per run attempt; `MustRun`
/// and `UpToDate` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Unchecked,
    ParamsCompare,
    InputSignatureCompare,
    CustomCheckPending,
    MustRun,
    UpToDate,
}

/// Inputs to one check evaluation
pub struct CheckRequest<'a> {
    pub check: Option<&'a CheckSpec>,
    pub record: Option<&'a ExecRecord>,
    pub params: &'a BTreeMap<String, Value>,
    pub inputs: &'a [DataItem],
    /// True when any producing task reported a change this run
    pub inputs_changed: bool,
    pub run_dir: &'a Path,
}

/// Walk the state machine to a terminal state
pub async fn evaluate(request: CheckRequest<'_>, registry: &ImplRegistry) -> CheckState {
    let mut state = CheckState::Unchecked;

    loop {
        state = match state {
            CheckState::Unchecked => {
                // A literal `false` always forces re-execution without
                // invoking anything
                if matches!(request.check, Some(CheckSpec::Enabled(false))) {
                    CheckState::MustRun
                } else if request.record.is_none() {
                    CheckState::MustRun
                } else {
                    CheckState::ParamsCompare
                }
            }

            CheckState::ParamsCompare => {
                let Some(record) = request.record else {
                    return CheckState::MustRun;
                };
                if &record.params == request.params {
                    CheckState::InputSignatureCompare
                } else {
                    CheckState::MustRun
                }
            }

            CheckState::InputSignatureCompare => {
                let Some(record) = request.record else {
                    return CheckState::MustRun;
                };
                let current: Vec<InputSignature> = ExecRecord::signature_of(request.inputs);
                if record.input_signature != current || request.inputs_changed {
                    CheckState::MustRun
                } else if matches!(request.check, Some(CheckSpec::Callback(_))) {
                    CheckState::CustomCheckPending
                } else {
                    CheckState::UpToDate
                }
            }

            CheckState::CustomCheckPending => {
                let Some(CheckSpec::Callback(name)) = request.check else {
                    return CheckState::MustRun;
                };
                match registry.get_check(name) {
                    Some(check) => {
                        let memento = request.record.and_then(|r| r.memento.as_ref());
                        if check.is_up_to_date(memento, request.run_dir).await {
                            CheckState::UpToDate
                        } else {
                            CheckState::MustRun
                        }
                    }
                    None => {
                        tracing::warn!("unknown check callback '{}', forcing run", name);
                        CheckState::MustRun
                    }
                }
            }

            CheckState::MustRun => return CheckState::MustRun,
            CheckState::UpToDate => return CheckState::UpToDate,
        };
    }
}
