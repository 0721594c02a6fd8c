//! Transfer-event pipeline: decoded token transfers become `token_transfers` rows in
//! the transaction's shard plus per-address index rows in each party's
//! economy-address shard.

use std::{collections::HashMap, sync::Arc};

use tracing::{debug, info};

use crate::{
    decoder::{DecodedTransfer, EventDecoder, ZERO_ADDRESS},
    errors::{BlockchainError, Result},
    repositories::{
        economy::register_economy,
        economy_address::{
            address_transaction_key, address_transfer_key, EconomyAddressTransactionRow,
            EconomyAddressTransferRow, TransferDirection,
        },
        shard_pointer::PointerMarker,
        transaction::{token_transfer_key, BlockContext, TokenTransferRow},
    },
    rpc::RpcLog,
    shard::ShardDirectory,
    store::{write_with_retries, ItemKey, Put, RetryPolicy},
    types::{Address, LogicalKey, PartitionKind, ShardIdentifier, TransactionHash},
};

/// One side of a transfer, as seen from `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferParty {
    pub address: Address,
    pub counterparty: Address,
    pub direction: TransferDirection,
}

/// Non-zero parties of a transfer. Mints and burns only index the real holder.
#[must_use]
pub fn transfer_parties(from: &Address, to: &Address) -> Vec<TransferParty> {
    let mut parties = Vec::with_capacity(2);
    if from.value() != ZERO_ADDRESS {
        parties.push(TransferParty {
            address: from.clone(),
            counterparty: to.clone(),
            direction: TransferDirection::Outgoing,
        });
    }
    if to.value() != ZERO_ADDRESS && to != from {
        parties.push(TransferParty {
            address: to.clone(),
            counterparty: from.clone(),
            direction: TransferDirection::Incoming,
        });
    }
    parties
}

/// Every economy-address index key a persisted transfer produced.
pub async fn economy_address_index_keys(
    directory: &ShardDirectory,
    transfers: &[TokenTransferRow],
) -> Result<Vec<ItemKey>> {
    let Some(first) = transfers.first() else {
        return Ok(Vec::new());
    };
    let chain_id = first.chain_id;

    let logical: Vec<LogicalKey> = transfers
        .iter()
        .flat_map(|transfer| {
            transfer_parties(&transfer.from, &transfer.to)
                .into_iter()
                .map(|party| {
                    LogicalKey::economy_address(
                        chain_id,
                        transfer.contract_address.clone(),
                        party.address,
                    )
                })
        })
        .collect();
    let shards = directory
        .resolve(PartitionKind::EconomyAddress, &logical)
        .await?;

    let mut keys = Vec::new();
    for transfer in transfers {
        for party in transfer_parties(&transfer.from, &transfer.to) {
            let key = LogicalKey::economy_address(
                chain_id,
                transfer.contract_address.clone(),
                party.address.clone(),
            );
            let Some(shard) = shards.get(&key) else {
                continue;
            };
            keys.push(address_transaction_key(
                shard,
                &transfer.contract_address,
                &party.address,
                transfer.timestamp,
                &transfer.transaction_hash,
            ));
            keys.push(address_transfer_key(
                shard,
                &transfer.contract_address,
                &party.address,
                transfer.timestamp,
                &transfer.transaction_hash,
                transfer.event_index,
            ));
        }
    }
    keys.sort();
    keys.dedup();
    Ok(keys)
}

pub struct TransferPipeline {
    directory: Arc<ShardDirectory>,
    decoder: Arc<dyn EventDecoder>,
    policy: RetryPolicy,
}

impl TransferPipeline {
    pub fn new(
        directory: Arc<ShardDirectory>,
        decoder: Arc<dyn EventDecoder>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            directory,
            decoder,
            policy,
        }
    }

    /// Decodes `logs` of one transaction and persists its transfers. Returns the
    /// number of transfers written; any row left unwritten fails the transaction.
    pub async fn process(
        &self,
        context: &BlockContext,
        hash: &TransactionHash,
        transaction_shard: &ShardIdentifier,
        logs: &[RpcLog],
        ordinal: usize,
    ) -> Result<usize> {
        let decoded = self.decoder.decode(logs);
        if decoded.is_empty() {
            return Ok(0);
        }

        let mut puts = Vec::with_capacity(decoded.len() * 3);
        let mut seen_contracts: Vec<&Address> = Vec::new();
        let mut address_shards: HashMap<LogicalKey, ShardIdentifier> = HashMap::new();

        for (offset, transfer) in decoded.iter().enumerate() {
            puts.push(Put::from_row(
                token_transfer_key(transaction_shard, hash, transfer.event_index),
                &Self::transfer_row(context, hash, transfer),
            )?);

            if !seen_contracts.contains(&&transfer.contract_address) {
                seen_contracts.push(&transfer.contract_address);
                if register_economy(
                    self.directory.store().as_ref(),
                    context.chain_id,
                    &transfer.contract_address,
                    context.block_number,
                )
                .await?
                {
                    info!(
                        "[transfers] New economy {} first seen in block {}",
                        transfer.contract_address, context.block_number
                    );
                }
            }

            for party in transfer_parties(&transfer.from, &transfer.to) {
                let key = LogicalKey::economy_address(
                    context.chain_id,
                    transfer.contract_address.clone(),
                    party.address.clone(),
                );
                let shard = match address_shards.get(&key) {
                    Some(shard) => shard.clone(),
                    None => {
                        let assignment = self
                            .directory
                            .assign(
                                key.clone(),
                                PointerMarker::CreatedInBlock(context.block_number),
                                ordinal + offset,
                            )
                            .await?;
                        let shard = assignment.shard().clone();
                        address_shards.insert(key, shard.clone());
                        shard
                    }
                };

                puts.push(Put::from_row(
                    address_transaction_key(
                        &shard,
                        &transfer.contract_address,
                        &party.address,
                        context.timestamp,
                        hash,
                    ),
                    &EconomyAddressTransactionRow {
                        chain_id: context.chain_id,
                        contract_address: transfer.contract_address.clone(),
                        address: party.address.clone(),
                        transaction_hash: hash.clone(),
                        block_number: context.block_number,
                        timestamp: context.timestamp,
                    },
                )?);
                puts.push(Put::from_row(
                    address_transfer_key(
                        &shard,
                        &transfer.contract_address,
                        &party.address,
                        context.timestamp,
                        hash,
                        transfer.event_index,
                    ),
                    &EconomyAddressTransferRow {
                        chain_id: context.chain_id,
                        contract_address: transfer.contract_address.clone(),
                        address: party.address,
                        counterparty: party.counterparty,
                        direction: party.direction,
                        amount: transfer.amount.clone(),
                        transaction_hash: hash.clone(),
                        event_index: transfer.event_index,
                        block_number: context.block_number,
                        timestamp: context.timestamp,
                    },
                )?);
            }
        }

        let left = write_with_retries(self.directory.store().as_ref(), puts, self.policy).await?;
        if !left.is_empty() {
            return Err(BlockchainError::unprocessed("transfer rows", left.len()));
        }

        debug!("[transfers] {} transfer(s) in {}", decoded.len(), hash);
        Ok(decoded.len())
    }

    fn transfer_row(
        context: &BlockContext,
        hash: &TransactionHash,
        transfer: &DecodedTransfer,
    ) -> TokenTransferRow {
        TokenTransferRow {
            chain_id: context.chain_id,
            transaction_hash: hash.clone(),
            event_index: transfer.event_index,
            kind: transfer.kind,
            contract_address: transfer.contract_address.clone(),
            from: transfer.from.clone(),
            to: transfer.to.clone(),
            amount: transfer.amount.clone(),
            block_number: context.block_number,
            timestamp: context.timestamp,
        }
    }
}
