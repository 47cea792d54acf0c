// Voter key tool for the ovote node
// Generates Ed25519 voter keys and signs vote packages

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ovote_node::crypto::{public_from_seed, sign_vote, vote_bytes_from_value};
use ovote_node::types::{CensusProof, VotePackage};
use std::fs;

#[derive(Parser)]
#[command(name = "ovote-keygen")]
#[command(about = "Generate voter keys and sign votes for an ovote node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new voter key pair
    New {
        /// Print only the seed
        #[arg(short, long)]
        stdout: bool,
    },
    /// Sign a vote and print the package to submit to POST /process/{id}
    SignVote {
        /// Voter secret seed (32 bytes hex)
        #[arg(long)]
        seed: String,
        #[arg(long)]
        chain_id: u64,
        #[arg(long)]
        process_id: u64,
        /// Vote value
        #[arg(long)]
        value: u64,
        /// File holding the census proof returned by GET /census/{id}/merkleproof/{pubkey}
        #[arg(long)]
        proof: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::New { stdout } => generate_key(stdout)?,
        Commands::SignVote {
            seed,
            chain_id,
            process_id,
            value,
            proof,
        } => sign(&seed, chain_id, process_id, value, &proof)?,
    }

    Ok(())
}

fn generate_key(stdout: bool) -> Result<()> {
    let seed = generate_seed();
    if stdout {
        println!("{}", hex::encode(seed));
    } else {
        println!("VOTER_SEED={}", hex::encode(seed));
        println!("VOTER_PUBLIC_KEY={}", hex::encode(public_from_seed(&seed)));
        println!("\nRegister the public key in a census; keep the seed secret");
    }
    Ok(())
}

fn sign(seed_hex: &str, chain_id: u64, process_id: u64, value: u64, proof_path: &str) -> Result<()> {
    let raw = hex::decode(seed_hex.trim_start_matches("0x")).context("seed is not hex")?;
    let seed: [u8; 32] = match raw.as_slice().try_into() {
        Ok(s) => s,
        Err(_) => bail!("seed must be 32 bytes, got {}", raw.len()),
    };

    let proof_json = fs::read_to_string(proof_path)
        .with_context(|| format!("failed to read proof file {}", proof_path))?;
    let census_proof: CensusProof =
        serde_json::from_str(&proof_json).context("invalid census proof")?;
    if census_proof.public_key != public_from_seed(&seed) {
        bail!("census proof belongs to a different public key");
    }

    let vote_bytes = vote_bytes_from_value(value);
    let package = VotePackage {
        signature: sign_vote(&seed, chain_id, process_id, &vote_bytes),
        census_proof,
        vote_bytes,
    };
    println!("{}", serde_json::to_string_pretty(&package)?);
    Ok(())
}

fn generate_seed() -> [u8; 32] {
    use rand::RngCore;
    let mut seed = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    seed
}
