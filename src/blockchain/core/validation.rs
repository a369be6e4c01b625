use crate::blockchain::core::block::Block;
use crate::error::ChainError;

/// Structural checks for `block` as the direct successor of `previous`.
pub fn validate_successor(previous: &Block, block: &Block) -> Result<(), ChainError> {
    let expected = previous.index.checked_add(1).ok_or_else(|| {
        ChainError::InvalidBlock(format!("Block index {} has no successor.", previous.index))
    })?;
    if block.index != expected {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid block index. Expected {}, but got {}.",
            expected, block.index
        )));
    }

    if block.previous_hash != previous.hash {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid previous hash at index {}. Expected {}, but got {}.",
            block.index, previous.hash, block.previous_hash
        )));
    }

    let calculated = block.calculate_hash();
    if block.hash != calculated {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid hash at index {}. Expected {}, but got {}.",
            block.index, calculated, block.hash
        )));
    }

    Ok(())
}

/// Checks a whole candidate chain against the local genesis hash. The first
/// block must sit at index 0 and carry that hash. Stops at the first
/// violation.
pub fn validate_chain(candidate: &[Block], genesis_hash: &str) -> Result<(), ChainError> {
    let genesis = candidate
        .first()
        .ok_or_else(|| ChainError::InvalidBlock("Candidate chain is empty.".to_string()))?;

    if genesis.index != 0 {
        return Err(ChainError::InvalidBlock(format!(
            "Genesis block must have index 0, got {}.",
            genesis.index
        )));
    }

    if genesis.hash != genesis_hash {
        return Err(ChainError::InvalidBlock(format!(
            "Genesis block hashes don't match: ours {}, theirs {}.",
            genesis_hash, genesis.hash
        )));
    }

    for pair in candidate.windows(2) {
        validate_successor(&pair[0], &pair[1])?;
    }

    Ok(())
}
