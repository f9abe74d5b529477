// Test-only workspace member; everything lives under tests/.
