use anyhow::{Context as _, Result};
use bitcoin::Network;
use bitcoin::hashes::Hash as _;
use lightning_invoice::Bolt11Invoice;
use std::str::FromStr as _;

/// The parts of a BOLT11 claim the swap flow acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInvoice {
    pub payment_hash: [u8; 32],
    /// Whole satoshis.
    pub amount_sat: u64,
    /// Hex encoded compressed payee pubkey.
    pub destination: String,
}

pub fn decode_invoice(invoice: &str, network: Network) -> Result<DecodedInvoice> {
    let invoice = Bolt11Invoice::from_str(invoice.trim())
        .map_err(|e| anyhow::anyhow!("parse BOLT11 invoice: {e:?}"))?;

    let invoice_network = invoice.network();
    anyhow::ensure!(
        invoice_network == network,
        "invoice network mismatch: invoice={invoice_network} expected={network}"
    );

    let amount_msat = invoice
        .amount_milli_satoshis()
        .context("invoice has no amount")?;
    let destination = invoice.recover_payee_pub_key();

    Ok(DecodedInvoice {
        payment_hash: invoice.payment_hash().to_byte_array(),
        amount_sat: amount_msat / 1000,
        destination: hex::encode(destination.serialize()),
    })
}
