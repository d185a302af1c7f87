//! Simple standalone example of the replicated document core.
//!
//! Two replicas edit concurrently, exchange their operation logs, and
//! converge to the same document without coordination.
//!
//! Run with: cargo run --example simple

use cowrite::{Replica, ReplicaId};
use serde_json::Value;

fn main() {
    println!("=== Simple replica example ===\n");

    // Two replicas representing two editing sessions.
    let mut alice = Replica::new(ReplicaId::from_u128(1));
    let mut bob = Replica::new(ReplicaId::from_u128(2));

    println!("Alice (replica 1) and Bob (replica 2) start editing a document\n");

    // Alice types "Hello".
    println!("Alice types 'Hello':");
    for (pos, ch) in "Hello".chars().enumerate() {
        alice.insert_at(pos, ch).unwrap();
    }
    println!("  Alice's document: '{}'", alice.text());

    // Bob concurrently types "World!" without having seen any of it.
    println!("\nBob concurrently types 'World!':");
    for (pos, ch) in "World!".chars().enumerate() {
        bob.insert_at(pos, ch).unwrap();
    }
    println!("  Bob's document: '{}'", bob.text());

    println!("\n--- Before synchronization ---");
    println!("  Alice sees: '{}'", alice.text());
    println!("  Bob sees:   '{}'", bob.text());

    // Exchange exactly the operations the other side has not seen, using
    // each side's causal frontier.
    println!("\n--- Synchronizing ---");
    println!("Alice receives Bob's operations...");
    for op in bob.missing_for(&alice.frontier()) {
        alice.apply(op);
    }
    println!("Bob receives Alice's operations...");
    for op in alice.missing_for(&bob.frontier()) {
        bob.apply(op);
    }

    println!("\n--- After synchronization ---");
    println!("  Alice sees: '{}'", alice.text());
    println!("  Bob sees:   '{}'", bob.text());

    if alice.text() == bob.text() {
        println!("\n✓ SUCCESS: Both replicas converged to the same document!");
        println!("✓ Final content: '{}'", alice.text());
    } else {
        println!("\n✗ ERROR: Documents did not converge!");
    }

    // Deletion tombstones the character; concurrent anchors keep working.
    println!("\n=== Deletion example ===");
    println!("Alice deletes the first character");
    alice.delete_at(0).unwrap();
    println!("  Alice's document: '{}'", alice.text());

    println!("Synchronizing the deletion to Bob...");
    for op in alice.missing_for(&bob.frontier()) {
        bob.apply(op);
    }
    println!("  Bob's document: '{}'", bob.text());
    if alice.text() == bob.text() {
        println!("✓ Deletion synchronized successfully!");
    }

    // Formatting resolves last-writer-wins per attribute.
    println!("\n=== Formatting example ===");
    println!("Bob bolds the first three characters");
    bob.format_range(0..3, "bold", Value::Bool(true)).unwrap();
    for op in bob.missing_for(&alice.frontier()) {
        alice.apply(op);
    }
    let tree = alice.materialize();
    println!("  Alice's spans:");
    for span in &tree.spans {
        println!("    '{}' {:?}", span.text, span.attrs);
    }
    assert_eq!(tree, bob.materialize());
    println!("✓ Styled document is identical on both replicas");

    println!("\n=== Example complete ===");
    println!("Same operation set in, same document out, on every replica.");
}
