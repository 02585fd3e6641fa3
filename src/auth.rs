/// Shared-password check for the `hello` handshake.
#[derive(Debug, Clone)]
pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: String) -> Self {
        Self { password }
    }

    /// Compares without short-circuiting on the first differing byte.
    pub fn verify(&self, candidate: &str) -> bool {
        let expected = self.password.as_bytes();
        let given = candidate.as_bytes();
        if expected.len() != given.len() {
            return false;
        }
        expected
            .iter()
            .zip(given)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
