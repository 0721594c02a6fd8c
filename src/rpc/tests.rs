#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[allow(clippy::expect_used)]
mod unit_tests {
    use super::super::*;

    const BLOCK_JSON: &str = r#"{
        "jsonrpc": "2.0",
        "id": 1,
        "result": {
            "number": "0x4e",
            "hash": "0x9e0e9c7a3a1e0ca1d2e1f0f8c3e1d7f8a9b0c1d2e3f4a5b6c7d8e9f0a1b2c3d4",
            "parentHash": "0x1e0e9c7a3a1e0ca1d2e1f0f8c3e1d7f8a9b0c1d2e3f4a5b6c7d8e9f0a1b2c3d4",
            "timestamp": "0x5c8f1a2b",
            "gasUsed": "0x5208",
            "size": "0x2a1",
            "difficulty": "0x2",
            "miner": "0x0000000000000000000000000000000000000000",
            "nonce": "0x0000000000000000",
            "stateRoot": "0xaa",
            "receiptsRoot": "0xbb",
            "transactionsRoot": "0xcc",
            "sha3Uncles": "0xdd",
            "transactions": [
                "0x2FD6000000000000000000000000000000000000000000000000000000999b91"
            ]
        }
    }"#;

    #[test]
    fn test_block_deserializes_with_hash_transactions() {
        let response: RpcResponse<RpcBlock> = serde_json::from_str(BLOCK_JSON).unwrap();
        let block = response.result.unwrap();

        assert_eq!(response.id, Some(1));
        assert_eq!(block.block_number().unwrap().value(), 78);
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(
            block.transaction_hashes()[0].value(),
            "0x2fd6000000000000000000000000000000000000000000000000000000999b91"
        );
        assert_eq!(block.size.as_deref(), Some("0x2a1"));
        assert!(block.total_difficulty.is_none());
    }

    #[test]
    fn test_null_result_means_unknown_block() {
        let response: RpcResponse<RpcBlock> =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"result":null}"#).unwrap();
        assert!(response.result.is_none());
        assert!(response.error.is_none());
    }

    #[test]
    fn test_error_body_is_parsed() {
        let response: RpcResponse<RpcBlock> = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":7,"error":{"code":-32000,"message":"header not found"}}"#,
        )
        .unwrap();
        let err = response.error.unwrap();
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "header not found");
    }

    #[test]
    fn test_receipt_status() {
        let mut receipt = RpcReceipt {
            transaction_hash: "0x01".to_string(),
            transaction_index: Some("0x0".to_string()),
            status: Some("0x1".to_string()),
            gas_used: "0x5208".to_string(),
            cumulative_gas_used: None,
            contract_address: None,
            logs: vec![],
        };
        assert!(receipt.succeeded());

        receipt.status = Some("0x0".to_string());
        assert!(!receipt.succeeded());

        receipt.status = None;
        assert!(receipt.succeeded());
    }

    #[test]
    fn test_block_tag_params() {
        assert_eq!(BlockTag::Latest.to_param(), "latest");
        assert_eq!(
            BlockTag::Number(BlockNumber::from_trusted(78)).to_param(),
            "0x4e"
        );
    }

    #[test]
    fn test_full_transactions_expose_their_hash() {
        let tx = RpcTransaction {
            hash: "0xABC".to_string(),
            block_hash: None,
            block_number: Some("0x1".to_string()),
            transaction_index: Some("0x0".to_string()),
            from: Some("0x111".to_string()),
            to: None,
            value: "0x0".to_string(),
            gas: "0x5208".to_string(),
            gas_price: None,
            input: None,
            nonce: None,
        };
        let wrapped = BlockTransaction::Full(Box::new(tx));
        assert_eq!(wrapped.hash(), "0xABC");
    }

    #[tokio::test]
    async fn test_batch_call_with_no_params_skips_the_network() {
        let client = EthereumJsonRpcClient::new("http://127.0.0.1:1".to_string(), 0);
        let result = client.get_transaction_receipts(&[]).await.unwrap();
        assert!(result.is_empty());
    }
}
