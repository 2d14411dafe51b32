use dekwrap_core::{Verification, WorkflowConfig, WorkflowReport};

pub fn banner(config: &WorkflowConfig) {
    println!(
        "==> Wrapping {} under KEK '{}' on slot {}, storing as '{}'",
        config.dek_file.display(),
        config.kek_label,
        config.slot,
        config.dek_label
    );
}

pub fn report(report: &WorkflowReport, verbose: bool) {
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    println!("KEK handle: {}", report.kek);
    println!("DEK read: {} bytes", report.plaintext_len);
    println!("Wrapped DEK: {} bytes", report.ciphertext.len());
    if verbose {
        println!("Wrapped DEK (hex): {}", upper_hex(&report.ciphertext));
        println!("Wrapped DEK SHA-256: {}", report.ciphertext_sha256);
    }
    if report.replaced_existing {
        println!("Replaced previous data object");
    }
    println!("Read back: {} bytes", report.retrieved_len);
    match report.verification {
        Verification::Match => println!("Verification: OK, unwrapped DEK matches"),
        Verification::Mismatch => println!("Verification: FAILED, unwrapped DEK differs"),
    }
}

fn upper_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_upper_case() {
        assert_eq!(upper_hex(&[0x0a, 0xbc, 0xff]), "0ABCFF");
    }
}
