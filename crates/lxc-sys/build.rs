const MINIMUM_VERSION: &str = "3.1.0";
const PKG_NAME: &str = "lxc";

fn main() {
    // The probe emits the link directives when liblxc is installed. When it
    // is not, the declarations still compile; only binaries that actually
    // call into liblxc will fail to link.
    if let Err(err) = pkg_config::Config::new()
        .atleast_version(MINIMUM_VERSION)
        .probe(PKG_NAME)
    {
        println!(
            "cargo:warning={:?} >= {:?} not found via pkg-config ({}); \
             linking liblxc-dependent binaries will fail",
            PKG_NAME, MINIMUM_VERSION, err
        );
    }
}
