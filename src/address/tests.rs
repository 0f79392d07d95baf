use std::collections::BTreeSet;

use super::{AddressLevel, SimulatorAddress};
use crate::error::AddressError;

#[test]
fn child_then_parent_returns_original() -> Result<(), AddressError> {
    let worker = SimulatorAddress::worker(3, 7)?;
    for address in [SimulatorAddress::coordinator(), SimulatorAddress::agent(2)?, worker] {
        for index in [1, 2, 42] {
            let child = address.child(index)?;
            if child.parent()? != address {
                return Err(AddressError::from(format!(
                    "{} child {} did not return to parent",
                    address, index
                )));
            }
        }
    }
    Ok(())
}

#[test]
fn parent_of_root_fails() -> Result<(), AddressError> {
    match SimulatorAddress::coordinator().parent() {
        Err(AddressError::RootHasNoParent) => Ok(()),
        Err(err) => Err(AddressError::from(format!("Unexpected error: {}", err))),
        Ok(parent) => Err(AddressError::from(format!(
            "Expected failure, got {}",
            parent
        ))),
    }
}

#[test]
fn test_address_is_leaf() -> Result<(), AddressError> {
    let test = SimulatorAddress::test(1, 1, 1)?;
    if test.child(1).is_ok() {
        return Err(AddressError::from("Test address produced a child"));
    }
    Ok(())
}

#[test]
fn zero_index_is_rejected() -> Result<(), AddressError> {
    if SimulatorAddress::agent(0).is_ok() {
        return Err(AddressError::from("Agent index 0 accepted"));
    }
    if SimulatorAddress::coordinator().child(0).is_ok() {
        return Err(AddressError::from("child(0) accepted"));
    }
    if SimulatorAddress::new(AddressLevel::Agent, 1, 2, 0).is_ok() {
        return Err(AddressError::from("Worker index set on agent address"));
    }
    Ok(())
}

#[test]
fn ancestry_follows_path() -> Result<(), AddressError> {
    let root = SimulatorAddress::coordinator();
    let agent = SimulatorAddress::agent(1)?;
    let other_agent = SimulatorAddress::agent(2)?;
    let test = SimulatorAddress::test(1, 4, 9)?;

    if !root.is_ancestor_of(&test) || !agent.is_ancestor_of(&test) {
        return Err(AddressError::from("Missing ancestor relation"));
    }
    if other_agent.is_ancestor_of(&test) {
        return Err(AddressError::from("Sibling branch reported as ancestor"));
    }
    if test.is_ancestor_of(&test) || agent.is_ancestor_of(&root) {
        return Err(AddressError::from("Ancestry must be strict and downward"));
    }
    if root.child_index_toward(&test) != Some(1) || agent.child_index_toward(&test) != Some(4) {
        return Err(AddressError::from("Wrong next child index"));
    }
    if other_agent.child_index_toward(&test).is_some() {
        return Err(AddressError::from("Next hop through unrelated agent"));
    }
    Ok(())
}

#[test]
fn ordering_is_level_then_indices() -> Result<(), AddressError> {
    let ordered: BTreeSet<SimulatorAddress> = [
        SimulatorAddress::test(1, 1, 1)?,
        SimulatorAddress::worker(2, 1)?,
        SimulatorAddress::worker(1, 2)?,
        SimulatorAddress::agent(3)?,
        SimulatorAddress::coordinator(),
    ]
    .into_iter()
    .collect();
    let rendered: Vec<String> = ordered.iter().map(ToString::to_string).collect();
    let expected = ["C", "A3", "A1_W2", "A2_W1", "A1_W1_T1"];
    if rendered != expected {
        return Err(AddressError::from(format!("Unexpected order: {:?}", rendered)));
    }
    Ok(())
}

#[test]
fn string_form_round_trips() -> Result<(), AddressError> {
    for text in ["C", "A1", "A1_W2", "A1_W2_T3", "A12_W340_T5"] {
        let address: SimulatorAddress = text.parse()?;
        if address.to_string() != text {
            return Err(AddressError::from(format!(
                "{} rendered as {}",
                text, address
            )));
        }
    }
    for bad in ["", "W1", "A1_T2", "A0", "A1_W2_T3_X4", "Ax"] {
        if bad.parse::<SimulatorAddress>().is_ok() {
            return Err(AddressError::from(format!("Accepted '{}'", bad)));
        }
    }
    Ok(())
}
