use std::time::Duration;

use anyhow::{Context as _, Result};
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};

/// Fixed creation time so invoices are reproducible.
pub const INVOICE_TIMESTAMP: u64 = 1_700_000_000;

/// A signed regtest invoice together with the secrets behind it.
#[derive(Debug, Clone)]
pub struct TestInvoice {
    pub bolt11: String,
    pub payment_hash: [u8; 32],
    pub preimage: [u8; 32],
    /// Hex encoded payee pubkey.
    pub node_id: String,
}

impl TestInvoice {
    pub fn payment_hash_hex(&self) -> String {
        hex::encode(self.payment_hash)
    }
}

pub fn node_key(seed: u8) -> Result<(SecretKey, String)> {
    let secp = Secp256k1::new();
    let key = SecretKey::from_slice(&[seed; 32]).context("node secret key")?;
    let pubkey = PublicKey::from_secret_key(&secp, &key);
    Ok((key, hex::encode(pubkey.serialize())))
}

pub fn regtest_invoice(amount_sat: u64, preimage: [u8; 32]) -> Result<TestInvoice> {
    invoice_for(Currency::Regtest, amount_sat, preimage, 0x11)
}

pub fn invoice_for(
    currency: Currency,
    amount_sat: u64,
    preimage: [u8; 32],
    node_seed: u8,
) -> Result<TestInvoice> {
    build_invoice(currency, Some(amount_sat), preimage, node_seed)
}

/// Regtest invoice that leaves the amount to the payer.
pub fn amountless_invoice(preimage: [u8; 32]) -> Result<TestInvoice> {
    build_invoice(Currency::Regtest, None, preimage, 0x11)
}

fn build_invoice(
    currency: Currency,
    amount_sat: Option<u64>,
    preimage: [u8; 32],
    node_seed: u8,
) -> Result<TestInvoice> {
    let secp = Secp256k1::new();
    let (key, node_id) = node_key(node_seed)?;
    let payment_hash = sha256::Hash::hash(&preimage);

    let builder = InvoiceBuilder::new(currency)
        .description("swap claim".to_string())
        .payment_hash(payment_hash)
        .payment_secret(PaymentSecret([42u8; 32]))
        .duration_since_epoch(Duration::from_secs(INVOICE_TIMESTAMP))
        .min_final_cltv_expiry_delta(144);
    let builder = match amount_sat {
        Some(sat) => builder.amount_milli_satoshis(sat * 1000),
        None => builder,
    };
    let invoice = builder
        .build_signed(|msg| secp.sign_ecdsa_recoverable(msg, &key))
        .map_err(|e| anyhow::anyhow!("build invoice: {e:?}"))?;

    Ok(TestInvoice {
        bolt11: invoice.to_string(),
        payment_hash: payment_hash.to_byte_array(),
        preimage,
        node_id,
    })
}
