//! Witness verification
//!
//! Each item (transaction, block, consensus payload) names the script hashes
//! that must approve it. The hashes are sorted and paired one-to-one with the
//! item's witnesses; each pair runs as invocation script followed by
//! verification script under the verification trigger, all drawing on one
//! shared gas budget.

use tracing::debug;

use crate::constants::VERIFY_METHOD;
use crate::error::{LedgerError, Result};
use crate::script::{app_call_verification_script, hash160, is_push_only};
use crate::settings::Settings;
use crate::state::Contract;
use crate::storage::ReadStorage;
use crate::types::*;
use crate::vm::*;
use crate::write_batch::WriteBatch;

/// Outcome of one witness
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WitnessResult {
    pub hash: Hash160,
    pub gas_consumed: Fixed8,
    /// Why the witness did not approve, `None` when it did
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WitnessVerification {
    pub results: Vec<WitnessResult>,
    pub gas_consumed: Fixed8,
}

impl WitnessVerification {
    pub fn is_verified(&self) -> bool {
        self.results.iter().all(|result| result.failure.is_none())
    }

    /// `ScriptVerify` carrying the first failure, if any
    pub fn into_result(self) -> Result<Fixed8> {
        match self.results.into_iter().find_map(|result| result.failure) {
            Some(message) => Err(LedgerError::ScriptVerify(message)),
            None => Ok(self.gas_consumed),
        }
    }
}

/// VerifyWitnesses: check every `(hash, witness)` pair of `container`
///
/// 1. |hashes| must equal |witnesses|; hashes are sorted ascending
/// 2. Budget = min(`gas`, max verification gas)
/// 3. Per pair: resolve the verification script. An empty inline script
///    delegates to the contract at `hash`, which must exist and expose
///    `verify`; otherwise the inline script must hash to `hash`
/// 4. Execute with the remaining budget, then subtract the gas used. A
///    budget that is already spent fails the witness without executing it
/// 5. The run must halt leaving exactly one true value on the stack
/// Missing contracts and hash mismatches are errors. Failed executions are
/// reported per witness and stop verification of the remaining pairs.
pub fn verify_witnesses<R: ReadStorage>(
    vm: &dyn Vm,
    settings: &Settings,
    view: &R,
    container: ScriptContainer<'_>,
    mut hashes: Vec<Hash160>,
    witnesses: &[Witness],
    gas: Fixed8,
) -> Result<WitnessVerification> {
    if hashes.len() != witnesses.len() {
        return Err(LedgerError::Verify(format!(
            "Expected {} witnesses, found {}",
            hashes.len(),
            witnesses.len()
        )));
    }
    hashes.sort();

    let mut budget = gas.min(settings.max_verification_gas);
    let mut verification = WitnessVerification { results: Vec::with_capacity(hashes.len()), gas_consumed: 0 };

    for (hash, witness) in hashes.into_iter().zip(witnesses) {
        let verification_script = resolve_verification_script(view, &hash, witness)?;
        if budget <= 0 {
            verification.results.push(WitnessResult {
                hash,
                gas_consumed: 0,
                failure: Some("Insufficient gas for verification".to_string()),
            });
            break;
        }
        if !is_push_only(&witness.invocation) {
            verification.results.push(WitnessResult {
                hash,
                gas_consumed: 0,
                failure: Some("Invocation script must only push data".to_string()),
            });
            break;
        }

        // every witness runs against its own scratch overlay
        let mut scratch = WriteBatch::new(settings, view, vm, None);
        let request = ExecuteScriptsRequest {
            scripts: vec![
                Script { code: witness.invocation.clone(), push_only: true },
                Script { code: verification_script, push_only: false },
            ],
            trigger: TriggerType::Verification,
            container,
            gas: budget,
            skip_witness_verify: false,
            action_context: None,
        };
        let result = match vm.execute_scripts(request, &mut scratch, &mut NullListeners) {
            Ok(result) => result,
            Err(e) => ExecutionResult {
                state: VmState::Fault,
                gas_consumed: 0,
                stack: Vec::new(),
                error_message: Some(e.to_string()),
            },
        };

        budget -= result.gas_consumed;
        verification.gas_consumed += result.gas_consumed;
        let failure = check_result(&result);
        if let Some(message) = &failure {
            debug!(hash = %hex::encode(hash), %message, "witness rejected");
        }
        let failed = failure.is_some();
        verification.results.push(WitnessResult { hash, gas_consumed: result.gas_consumed, failure });
        if failed {
            break;
        }
    }

    Ok(verification)
}

fn resolve_verification_script<R: ReadStorage>(view: &R, hash: &Hash160, witness: &Witness) -> Result<ByteString> {
    if witness.verification.is_empty() {
        let contract = view.try_get::<Contract>(hash)?.ok_or(LedgerError::WitnessVerify)?;
        if !contract.has_entry_point(VERIFY_METHOD) {
            return Err(LedgerError::WitnessVerify);
        }
        return Ok(app_call_verification_script(hash));
    }
    if hash160(&witness.verification) != *hash {
        return Err(LedgerError::WitnessVerify);
    }
    Ok(witness.verification.clone())
}

fn check_result(result: &ExecutionResult) -> Option<String> {
    if result.state == VmState::Fault {
        return Some(
            result
                .error_message
                .clone()
                .unwrap_or_else(|| "Verification execution faulted".to_string()),
        );
    }
    if result.stack.len() != 1 {
        return Some(format!(
            "Verification did not return one result. This may be a bug in the smart contract. Found {} results.",
            result.stack.len()
        ));
    }
    match result.stack[0].as_boolean() {
        Some(true) => None,
        Some(false) => Some("Verification did not succeed.".to_string()),
        None => Some("Verification did not return a boolean result.".to_string()),
    }
}
