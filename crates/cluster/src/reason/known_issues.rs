//! The catalog of known issues.
//!
//! Entries are ordered by the layer they belong to (program, resource, host,
//! provider, driver, local network, internet, guest, runtime, control plane,
//! service). Order matters: the first matching entry wins.

use regex::Regex;

use super::exit::*;
use super::{Kind, Style};

const PROXY_DOC: &str = "https://minikube.sigs.k8s.io/docs/handbook/vpn_and_proxy/";
const VPN_DOC: &str = "https://minikube.sigs.k8s.io/docs/handbook/vpn_and_proxy/";

const VIRT_DISABLED: &str = "Virtualization support is disabled on your computer. If you are running minikube within a VM, try '--driver=docker'. Otherwise, consult your systems BIOS manual for how to enable virtualization.";
const VIRT_UNSUPPORTED: &str = "Your host does not support virtualization. If you are running minikube within a VM, try '--driver=docker'. Otherwise, enable virtualization in your BIOS";
const DYNAMIC_MEMORY: &str =
    "Disable dynamic memory in your VM manager, or pass in a larger --memory value";
const RUN_AS_ADMIN: &str = "Right-click the PowerShell icon and select Run as Administrator to open PowerShell in elevated mode.";
const VBOX_REINSTALL: &str = "Reinstall VirtualBox and reboot. Alternatively, try the kvm2 driver: https://minikube.sigs.k8s.io/docs/reference/drivers/kvm2/";
const VBOX_HYPERV: &str = "VirtualBox and Hyper-V are having a conflict. Use '--driver=hyperv' or disable Hyper-V using: 'bcdedit /set hypervisorlaunchtype off'";
const VPN_ROUTING: &str = "Your host is failing to route packets to the minikube VM. If you have VPN software, try turning it off or configuring it so that it does not re-route traffic to the VM IP. If not, check your VM environment routing options.";
const FIREWALL: &str = "A firewall is likely blocking minikube from reaching the internet. You may need to configure minikube to use a proxy.";
const HTTPS_PROXY: &str =
    "Ensure that your value for HTTPS_PROXY points to an HTTPS proxy rather than an HTTP proxy";
const VM_GONE: &str =
    "The VM that minikube is configured for no longer exists. Run 'minikube delete'";
const GUEST_FILES_MISSING: &str = "minikube is missing files relating to your guest environment. This can be fixed by running 'minikube delete'";
const NONE_DRIVER_DOC: &str = "https://minikube.sigs.k8s.io/docs/reference/drivers/none";
const HYPERV_DOC: &str = "https://docs.docker.com/machine/drivers/hyper-v/";
const HYPERKIT_DOC: &str = "https://minikube.sigs.k8s.io/docs/reference/drivers/hyperkit/";
const KVM2_DOC: &str = "https://minikube.sigs.k8s.io/docs/reference/drivers/kvm2/";

/// A known issue: a kind, the pattern that identifies it and the host
/// operating systems it is specific to (empty means any).
pub struct Match {
    pub kind: Kind,
    pub regex: Regex,
    pub goos: &'static [&'static str],
}

fn m(kind: Kind, pattern: &str, goos: &'static [&'static str]) -> Match {
    Match {
        kind,
        regex: Regex::new(pattern).expect("known issue patterns are valid regular expressions"),
        goos,
    }
}

const LINUX: &[&str] = &["linux"];
const DARWIN: &[&str] = &["darwin"];
const WINDOWS: &[&str] = &["windows"];
const ANY: &[&str] = &[];

lazy_static::lazy_static! {
    /// All known issues, in matching order.
    pub static ref KNOWN_ISSUES: Vec<Match> = {
        let mut issues = Vec::new();
        issues.extend(program_issues());
        issues.extend(resource_issues());
        issues.extend(host_issues());
        issues.extend(provider_issues());
        issues.extend(driver_issues());
        issues.extend(local_network_issues());
        issues.extend(internet_issues());
        issues.extend(guest_issues());
        issues.extend(runtime_issues());
        issues.extend(control_plane_issues());
        issues.extend(service_issues());
        issues
    };
}

fn program_issues() -> Vec<Match> {
    vec![m(
        Kind::new("MK_KVERSION_USAGE", PROGRAM_USAGE).advice(
            "Specify --kubernetes-version in v<major>.<minor.<build> form. example: 'v1.1.14'",
        ),
        r"No Major.Minor.Patch elements found",
        ANY,
    )]
}

fn resource_issues() -> Vec<Match> {
    vec![
        m(
            Kind::new("RSRC_KVM_OOM", INSUFFICIENT_MEMORY)
                .advice("Choose a smaller value for --memory, such as 2000")
                .issues(&[6366]),
            r"cannot set up guest memory.*Cannot allocate memory",
            LINUX,
        ),
        m(
            Kind::new("RSRC_SSH_OOM", INSUFFICIENT_MEMORY)
                .advice(DYNAMIC_MEMORY)
                .issues(&[1766]),
            r"Process exited with status 137 from signal matchLL",
            ANY,
        ),
        m(
            Kind::new("RSRC_SCP_OOM", INSUFFICIENT_MEMORY)
                .advice(DYNAMIC_MEMORY)
                .issues(&[1766]),
            r"An existing connection was forcibly closed by the remote host",
            ANY,
        ),
        m(
            Kind::new("RSRC_INSUFFICIENT_CORES", INSUFFICIENT_CORES)
                .advice("Kubernetes requires at least 2 CPU's to start")
                .issues(&[7905])
                .url("https://kubernetes.io/docs/setup/production-environment/tools/kubeadm/install-kubeadm/")
                .style(Style::UnmetRequirement),
            r"ERROR.*the number of available CPUs 1 is less than the required 2",
            ANY,
        ),
    ]
}

fn host_issues() -> Vec<Match> {
    vec![
        m(
            Kind::new("HOST_VIRT_UNAVAILABLE", HOST_CONFIG)
                .advice(VIRT_DISABLED)
                .issues(&[3900, 4730]),
            r"This computer doesn't have VT-X/AMD-v enabled",
            ANY,
        ),
        m(
            Kind::new("HOST_VTX_DISABLED", HOST_CONFIG)
                .advice(VIRT_DISABLED)
                .issues(&[5282, 5456]),
            r"VT-x is disabled.*VERR_VMX_MSR_ALL_VMX_DISABLED",
            ANY,
        ),
        m(
            Kind::new("HOST_VTX_UNAVAILABLE", HOST_CONFIG)
                .advice(VIRT_UNSUPPORTED)
                .issues(&[1994, 5326]),
            r"VT-x is not available.*VERR_VMX_NO_VMX",
            ANY,
        ),
        m(
            Kind::new("HOST_SVM_DISABLED", HOST_CONFIG)
                .advice(VIRT_UNSUPPORTED)
                .issues(&[7074]),
            r"VERR_SVM_DISABLED",
            ANY,
        ),
        m(
            Kind::new("HOST_NON_C_DRIVE", HOST_USAGE)
                .advice("Run minikube from the C: drive.")
                .issues(&[1574]),
            r".iso: The system cannot find the path specified.",
            ANY,
        ),
        m(
            Kind::new("HOST_KUBECONFIG_WRITE", HOST_PERMISSION)
                .advice("Unset the KUBECONFIG environment variable, or verify that it does not point to an empty or otherwise invalid path")
                .issues(&[5268, 4100, 5207]),
            r"Failed to setup kubeconfig: writing kubeconfig",
            ANY,
        ),
        m(
            Kind::new("HOST_KUBECONFIG_PERMISSION", HOST_PERMISSION)
                .advice("Run: 'sudo chown $USER $HOME/.kube/config && chmod 600 $HOME/.kube/config'")
                .issues(&[5714])
                .style(Style::NotAllowed),
            r".kube/config: permission denied",
            &["darwin", "linux"],
        ),
        m(
            Kind::new("HOST_JUJU_LOCK_PERMISSION", HOST_PERMISSION)
                .advice("Run 'sudo sysctl fs.protected_regular=0', or try a driver which does not require root, such as '--driver=docker'")
                .issues(&[6391]),
            r"unable to open /tmp/juju.*: permission denied",
            LINUX,
        ),
        m(
            Kind::new("HOST_DOCKER_CHROMEOS", HOST_UNSUPPORTED)
                .advice("ChromeOS is missing the kernel support necessary for running Kubernetes")
                .issues(&[6411]),
            r"Container.*is not running.*chown docker:docker",
            ANY,
        ),
        m(
            Kind::new("HOST_PIDS_CGROUP", HOST_UNSUPPORTED)
                .advice("Ensure that the required 'pids' cgroup is enabled on your host: grep pids /proc/cgroups")
                .issues(&[6411]),
            r"failed to find subsystem mount for required subsystem: pids",
            LINUX,
        ),
        m(
            Kind::new("HOST_HOME_PERMISSION", GUEST_PERMISSION)
                .advice("Your user lacks permissions to the minikube profile directory. Run: 'sudo chown -R $USER $HOME/.minikube; chmod -R u+wrx $HOME/.minikube' to fix")
                .issues(&[9165]),
            r"/.minikube/.*: permission denied",
            ANY,
        ),
    ]
}

fn provider_issues() -> Vec<Match> {
    vec![
        m(
            Kind::new("PR_PRECREATE_EXIT_1", PROVIDER_ERROR)
                .advice("The hypervisor does not appear to be configured properly. Run 'minikube start --alsologtostderr -v=1' and inspect the error code")
                .issues(&[6098]),
            r"precreate: exit status 1",
            ANY,
        ),
        m(
            Kind::new("PR_DOCKER_CGROUP_MOUNT", PROVIDER_ERROR)
                .advice("Run: 'sudo mkdir /sys/fs/cgroup/systemd && sudo mount -t cgroup -o none,name=systemd cgroup /sys/fs/cgroup/systemd'")
                .url("https://github.com/microsoft/WSL/issues/4189")
                .issues(&[5392]),
            r"cannot find cgroup mount destination: unknown",
            LINUX,
        ),
        m(
            Kind::new("PR_DOCKER_READONLY_VOL", PROVIDER_ERROR)
                .advice("Restart Docker")
                .issues(&[6825]),
            r"mkdir /var/lib/docker/volumes.*: read-only file system",
            ANY,
        ),
        m(
            Kind::new("PR_DOCKER_NO_SSH", PROVIDER_TIMEOUT)
                .advice("Restart Docker, Ensure docker is running and then run: 'minikube delete' and then 'minikube start' again")
                .url("https://github.com/kubernetes/minikube/issues/8163#issuecomment-652627436")
                .issues(&[8163]),
            r#"executing "" at <index \(index .NetworkSettings.Ports "22/tcp"\) 0>"#,
            ANY,
        ),
        m(
            Kind::new("PR_DOCKER_MOUNTS_EOF", PROVIDER_ERROR)
                .advice("Reset Docker to factory defaults")
                .url("https://docs.docker.com/docker-for-mac/#reset")
                .issues(&[8832]),
            r"docker:.*Mounts denied: EOF",
            DARWIN,
        ),
        m(
            Kind::new("PR_DOCKER_MOUNTS_EOF", PROVIDER_ERROR)
                .advice("Reset Docker to factory defaults")
                .url("https://docs.docker.com/docker-for-windows/#reset")
                .issues(&[8832]),
            r"docker:.*Mounts denied: EOF",
            WINDOWS,
        ),
        m(
            Kind::new("PR_HYPERKIT_NO_IP", PROVIDER_ERROR)
                .advice("Install the latest hyperkit binary, and run 'minikube delete'")
                .url(HYPERKIT_DOC)
                .issues(&[1926, 4206]),
            r"IP address never found in dhcp leases file Temporary Error: Could not find an IP address for",
            DARWIN,
        ),
        m(
            Kind::new("PR_HYPERKIT_NOT_FOUND", PROVIDER_NOT_FOUND)
                .advice("Please install the minikube hyperkit VM driver, or select an alternative --driver")
                .url(HYPERKIT_DOC),
            r#"Driver "hyperkit" not found."#,
            DARWIN,
        ),
        m(
            Kind::new("PR_HYPERKIT_VMNET_FRAMEWORK", PROVIDER_ERROR)
                .advice("Hyperkit networking is broken. Upgrade to the latest hyperkit version and/or Docker for Desktop. Alternatively, you may choose an alternate --driver")
                .issues(&[6028, 5594]),
            r"error from vmnet.framework: -1",
            DARWIN,
        ),
        m(
            Kind::new("PR_HYPERKIT_CRASHED", PROVIDER_ERROR)
                .advice("Hyperkit is broken. Upgrade to the latest hyperkit version and/or Docker for Desktop. Alternatively, you may choose an alternate --driver")
                .issues(&[6079, 5780]),
            r"hyperkit crashed!",
            DARWIN,
        ),
        m(
            Kind::new("PR_HYPERV_AS_ADMIN", PROVIDER_PERMISSION)
                .advice(RUN_AS_ADMIN)
                .url("https://rominirani.com/docker-machine-windows-10-hyper-v-troubleshooting-tips-367c1ea73c24")
                .issues(&[4511]),
            r"Hyper-v commands have to be run as an Administrator",
            WINDOWS,
        ),
        m(
            Kind::new("PR_HYPERV_NEEDS_ESC", PROVIDER_PERMISSION)
                .advice(RUN_AS_ADMIN)
                .issues(&[7347]),
            r"The requested operation requires elevation.",
            WINDOWS,
        ),
        m(
            Kind::new("PR_POWERSHELL_CONSTRAINED", PROVIDER_PERMISSION)
                .advice("PowerShell is running in constrained mode, which is incompatible with Hyper-V scripting.")
                .url("https://devblogs.microsoft.com/powershell/powershell-constrained-language-mode/")
                .issues(&[7347]),
            r"MethodInvocationNotSupportedInConstrainedLanguage",
            WINDOWS,
        ),
        m(
            Kind::new("PR_HYPERV_MODULE_NOT_INSTALLED", PROVIDER_NOT_FOUND)
                .advice("Run: 'Enable-WindowsOptionalFeature -Online -FeatureName Microsoft-Hyper-V-Tools-All'")
                .url("https://www.altaro.com/hyper-v/install-hyper-v-powershell-module/")
                .issues(&[7347]),
            r"Hyper-V PowerShell Module is not available",
            WINDOWS,
        ),
        m(
            Kind::new("PR_KVM_CAPABILITIES", PROVIDER_UNAVAILABLE)
                .advice("Your host does not support KVM virtualization. Ensure that qemu-kvm is installed, and run 'virt-host-validate' to debug the problem")
                .url("http://mikko.repolainen.fi/documents/virtualization-with-kvm")
                .issues(&[2991]),
            r"invalid argument: could not find capabilities for domaintype=kvm",
            LINUX,
        ),
        m(
            Kind::new("PR_KVM_SOCKET", PROVIDER_UNAVAILABLE)
                .advice("Check that libvirt is setup properly")
                .url(KVM2_DOC),
            r"error connecting to libvirt socket",
            LINUX,
        ),
        m(
            Kind::new("PR_KVM_ISO_PERMISSION", PROVIDER_PERMISSION)
                .advice("Ensure that the user listed in /etc/libvirt/qemu.conf has access to your home directory")
                .issues(&[5950]),
            r"boot2docker.iso.*Permission denied",
            LINUX,
        ),
        m(
            Kind::new("PR_KVM_NET_XML", PROVIDER_CONFIG)
                .advice("Rebuild libvirt with virt-network support")
                .url("https://forums.gentoo.org/viewtopic-t-981692-start-0.html")
                .issues(&[4195]),
            r"not supported by the connection driver: virNetworkDefineXML",
            LINUX,
        ),
        m(
            Kind::new("PR_KVM_MSR", PROVIDER_ERROR)
                .advice("Upgrade to QEMU v3.1.0+, run 'virt-host-validate', or ensure that you are not running in a nested VM environment.")
                .issues(&[4277]),
            r"qemu unexpectedly closed the monitor.*failed to set MSR",
            LINUX,
        ),
        m(
            Kind::new("PR_KVM_CREATE_BUSY", DRIVER_CONFLICT)
                .advice("Another hypervisor, such as VirtualBox, is conflicting with KVM. Please stop the other hypervisor, or use --driver to switch to it.")
                .issues(&[4913]),
            r"KVM_CREATE_VM.* failed:.* Device or resource busy",
            LINUX,
        ),
        m(
            Kind::new("PR_VBOX_BLOCKED", PROVIDER_PERMISSION)
                .advice("Reinstall VirtualBox and verify that it is not blocked: System Preferences -> Security & Privacy -> General -> Some system software was blocked from loading")
                .issues(&[4107]),
            r"NS_ERROR.*0x80004005",
            DARWIN,
        ),
        m(
            Kind::new("PR_VBOX_MODULE", PROVIDER_NOT_RUNNING)
                .advice(VBOX_REINSTALL)
                .issues(&[4043, 4711]),
            r"vboxdrv kernel module is not loaded",
            ANY,
        ),
        m(
            Kind::new("PR_VBOX_DEVICE_MISSING", PROVIDER_NOT_RUNNING)
                .advice(VBOX_REINSTALL)
                .issues(&[3974]),
            r"vboxdrv does not exist",
            ANY,
        ),
        m(
            Kind::new("PR_VBOX_HARDENING", PROVIDER_CONFLICT)
                .advice("VirtualBox is broken. Disable real-time anti-virus software, reboot, and reinstall VirtualBox if the problem continues.")
                .url("https://forums.virtualbox.org/viewtopic.php?f=25&t=82106")
                .issues(&[3859, 3910]),
            r"terminated unexpectedly.*VBoxHardening",
            WINDOWS,
        ),
        m(
            Kind::new("PR_VBOX_80004005", PROVIDER_ERROR)
                .advice("VirtualBox is broken. Reinstall VirtualBox, reboot, and run 'minikube delete'.")
                .issues(&[5227]),
            r"terminated unexpectedly.*NS_ERROR.*0x80004005",
            LINUX,
        ),
        m(
            Kind::new("PR_VBOX_HYPERV_64_BOOT", PROVIDER_CONFLICT)
                .advice(VBOX_HYPERV)
                .issues(&[4051, 4783]),
            r"VirtualBox won't boot a 64bits VM when Hyper-V is activated",
            ANY,
        ),
        m(
            Kind::new("PR_VBOX_HYPERV_CONFLICT", PROVIDER_CONFLICT)
                .advice(VBOX_HYPERV)
                .issues(&[4587]),
            r"vrc=VERR_NEM_VM_CREATE",
            ANY,
        ),
        m(
            Kind::new("PR_VBOXMANAGE_NOT_FOUND", PROVIDER_NOT_FOUND)
                .advice("Install VirtualBox and ensure it is in the path, or select an alternative value for --driver")
                .url("https://minikube.sigs.k8s.io/docs/start/")
                .issues(&[3784]),
            r"VBoxManage not found. Make sure VirtualBox is installed and VBoxManage is in the path",
            ANY,
        ),
    ]
}

fn driver_issues() -> Vec<Match> {
    vec![
        m(
            Kind::new("DRV_CORRUPT", DRIVER_ERROR)
                .advice("The VM driver exited with an error, and may be corrupt. Run 'minikube start' with --alsologtostderr -v=8 to see the error")
                .url("https://minikube.sigs.k8s.io/docs/reference/drivers/")
                .new_issue_link(),
            r"Error attempting to get plugin server address for RPC",
            ANY,
        ),
        m(
            Kind::new("DRV_EXITED_1", DRIVER_ERROR)
                .advice("The VM driver crashed. Run 'minikube start --alsologtostderr -v=8' to see the VM driver error message")
                .url("https://minikube.sigs.k8s.io/docs/reference/drivers/#troubleshooting")
                .new_issue_link(),
            r"Unable to start VM: start: exit status 1",
            ANY,
        ),
        m(
            Kind::new("DRV_REGISTRY_NOT_FOUND", DRIVER_UNSUPPORTED)
                .advice("Your minikube config refers to an unsupported driver. Erase ~/.minikube, and try again.")
                .issues(&[5295]),
            r"registry: driver not found",
            ANY,
        ),
        m(
            Kind::new("DRV_MISSING_ADDRESS", DRIVER_ERROR)
                .advice("The machine-driver specified is failing to start. Try running 'docker-machine-driver-<type> version'")
                .issues(&[6023, 4679])
                .new_issue_link(),
            r"new host: dial tcp: missing address",
            ANY,
        ),
        m(
            Kind::new("DRV_CREATE_TIMEOUT", DRIVER_TIMEOUT)
                .advice("Try 'minikube delete', and disable any conflicting VPN or firewall software")
                .issues(&[7072]),
            r"create host timed out in \d",
            ANY,
        ),
        m(
            Kind::new("DRV_IMAGE_ARCH_UNSUPPORTED", DRIVER_UNSUPPORTED)
                .advice("This driver does not yet work on your architecture. Maybe try --driver=none")
                .issues(&[7071]),
            r"Error: incompatible image architecture",
            LINUX,
        ),
        m(
            Kind::new("DRV_HYPERV_NO_VSWITCH", DRIVER_CONFIG)
                .advice("Configure an external network switch following the official documentation, then add `--hyperv-virtual-switch=<switch-name>` to `minikube start`")
                .url(HYPERV_DOC),
            r"no External vswitch found. A valid vswitch must be available for this command to run.",
            WINDOWS,
        ),
        m(
            Kind::new("DRV_HYPERV_VSWITCH_NOT_FOUND", DRIVER_USAGE)
                .advice("Confirm that you have supplied the correct value to --hyperv-virtual-switch using the 'Get-VMSwitch' command")
                .url(HYPERV_DOC),
            r"precreate: vswitch.*not found",
            WINDOWS,
        ),
        m(
            Kind::new("DRV_HYPERV_POWERSHELL_NOT_FOUND", DRIVER_UNAVAILABLE)
                .advice("To start minikube with Hyper-V, Powershell must be in your PATH")
                .url(HYPERV_DOC),
            r"Powershell was not found in the path",
            WINDOWS,
        ),
        m(
            Kind::new("DRV_HYPERV_FILE_DELETE", DRIVER_CONFLICT)
                .advice("You may need to stop the Hyper-V Manager and run `minikube delete` again.")
                .issues(&[6804]),
            r"Unable to remove machine directory",
            WINDOWS,
        ),
        m(
            Kind::new("DRV_KVM2_NOT_FOUND", DRIVER_NOT_FOUND)
                .advice("Please install the minikube kvm2 VM driver, or select an alternative --driver")
                .url(KVM2_DOC),
            r#"Driver "kvm2" not found. Do you have the plugin binary .* accessible in your PATH"#,
            LINUX,
        ),
        m(
            Kind::new("DRV_RESTART_NO_IP", DRIVER_TIMEOUT)
                .advice("The KVM driver is unable to resurrect this old VM. Please run `minikube delete` to delete it and try again.")
                .issues(&[3901, 3434]),
            r"Error starting stopped host: Machine didn't return an IP after \d+ seconds",
            ANY,
        ),
        m(
            Kind::new("DRV_NO_IP", DRIVER_TIMEOUT)
                .advice("Check your firewall rules for interference, and run 'virt-host-validate' to check for KVM configuration issues. If you are running minikube within a VM, consider using --driver=none")
                .url(KVM2_DOC)
                .issues(&[4249, 3566]),
            r"Error in driver during machine creation: Machine didn't return an IP after \d+ seconds",
            LINUX,
        ),
    ]
}

fn local_network_issues() -> Vec<Match> {
    vec![
        m(
            Kind::new("IF_SSH_AUTH", LOCAL_NETWORK_CONFIG)
                .advice(VPN_ROUTING)
                .url(VPN_DOC)
                .issues(&[3930]),
            r"ssh: handshake failed: ssh: unable to authenticate.*, no supported methods remain",
            ANY,
        ),
        m(
            Kind::new("IF_SSH_NO_RESPONSE", LOCAL_NETWORK_CONFIG)
                .advice(VPN_ROUTING)
                .url(VPN_DOC)
                .issues(&[3388]),
            r"dial tcp .*:22: connectex: A connection attempt failed because the connected party did not properly respond",
            ANY,
        ),
        m(
            Kind::new("IF_HOST_CIDR_CONFLICT", LOCAL_NETWORK_CONFLICT)
                .advice("Specify an alternate --host-only-cidr value, such as 172.16.0.1/24")
                .issues(&[3594]),
            r"host-only cidr conflicts with the network address of a host interface",
            ANY,
        ),
        m(
            Kind::new("IF_VBOX_NOT_VISIBLE", LOCAL_NETWORK_NOT_FOUND)
                .advice("Reboot to complete VirtualBox installation, verify that VirtualBox is not blocked by your system, and/or use another hypervisor")
                .url("https://stackoverflow.com/questions/52277019/how-to-fix-vm-issue-with-minikube-start")
                .issues(&[3614, 4222, 5817]),
            r"The host-only adapter we just created is not visible",
            ANY,
        ),
        m(
            Kind::new("IF_VBOX_SAME_IP", LOCAL_NETWORK_CONFLICT)
                .advice("Use VirtualBox to remove the conflicting VM and/or network interfaces")
                .url("https://stackoverflow.com/questions/55573426/virtualbox-is-configured-with-multiple-host-only-adapters-with-the-same-ip-whe")
                .issues(&[3584]),
            r"VirtualBox is configured with multiple host-only adapters with the same IP",
            ANY,
        ),
        m(
            Kind::new("IF_VBOX_NOT_FOUND", LOCAL_NETWORK_NOT_FOUND)
                .advice("VirtualBox is unable to find its network interface. Try upgrading to the latest release and rebooting.")
                .issues(&[6036]),
            r"ERR_INTNET_FLT_IF_NOT_FOUND",
            ANY,
        ),
        m(
            Kind::new("IF_VBOX_UNSPECIFIED", LOCAL_NETWORK_CONFLICT)
                .advice("VirtualBox cannot create a network, probably because it conflicts with an existing network that minikube no longer knows about. Try running 'minikube delete'")
                .issues(&[5260]),
            r"Error setting up host only network on machine start.*Unspecified error",
            ANY,
        ),
        m(
            Kind::new("IF_SSH_TIMEOUT", LOCAL_NETWORK_TIMEOUT)
                .advice("Try 'minikube delete', and disable any conflicting VPN or firewall software")
                .issues(&[4617]),
            r"waiting for SSH to be available",
            ANY,
        ),
    ]
}

fn internet_issues() -> Vec<Match> {
    vec![
        m(
            Kind::new("INET_GCR_UNAVAILABLE", INTERNET_UNAVAILABLE)
                .advice("minikube is unable to access the Google Container Registry. You may need to configure it to use a HTTP proxy.")
                .url(PROXY_DOC)
                .issues(&[3860]),
            r"gcr.io.*443: connect: invalid argument",
            ANY,
        ),
        m(
            Kind::new("INET_RESET_BY_PEER", INTERNET_UNAVAILABLE)
                .advice(FIREWALL)
                .url(PROXY_DOC)
                .issues(&[3909]),
            r"Error downloading .*connection reset by peer",
            ANY,
        ),
        m(
            Kind::new("INET_DOWNLOAD_TIMEOUT", INTERNET_TIMEOUT)
                .advice(FIREWALL)
                .url(PROXY_DOC)
                .issues(&[3846]),
            r"Error downloading .*timeout",
            ANY,
        ),
        m(
            Kind::new("INET_TLS_OVERSIZED", INTERNET_CONFLICT)
                .advice("A firewall is interfering with minikube's ability to make outgoing HTTPS requests. You may need to change the value of the HTTPS_PROXY environment variable.")
                .url(PROXY_DOC)
                .issues(&[3857, 3759, 4252]),
            r"tls: oversized record received with length",
            ANY,
        ),
        m(
            Kind::new("INET_DOWNLOAD_BLOCKED", INTERNET_TIMEOUT)
                .advice(FIREWALL)
                .url(PROXY_DOC)
                .issues(&[3922, 6109, 6123]),
            r"iso: failed to download|download.*host has failed to respond",
            ANY,
        ),
        m(
            Kind::new("INET_PULL_TIMEOUT", INTERNET_TIMEOUT)
                .advice("A firewall is blocking Docker the minikube VM from reaching the image repository. You may need to select --image-repository, or use a proxy.")
                .url(PROXY_DOC)
                .issues(&[3898, 6070]),
            r"ImagePull.*Timeout exceeded while awaiting headers",
            ANY,
        ),
        m(
            Kind::new("INET_LOOKUP_HOST", INTERNET_CONFIG)
                .advice("Verify that your HTTP_PROXY and HTTPS_PROXY environment variables are set correctly.")
                .url(PROXY_DOC),
            r"dial tcp: lookup.*: no such host",
            ANY,
        ),
        m(
            Kind::new("INET_PROXY_CONFUSION", INTERNET_CONFIG)
                .advice(HTTPS_PROXY)
                .url(PROXY_DOC)
                .issues(&[6107]),
            r"http: server gave HTTP response to HTTPS client",
            ANY,
        ),
        m(
            Kind::new("INET_NOT_TLS", INTERNET_CONFIG)
                .advice(HTTPS_PROXY)
                .url(PROXY_DOC)
                .issues(&[7286]),
            r"tls: first record does not look like a TLS handshake",
            ANY,
        ),
        m(
            Kind::new("INET_PROXY_503", INTERNET_CONFIG)
                .advice("Confirm that you have a working internet connection and that your VM has not run out of resources by using: 'minikube logs'")
                .issues(&[4749]),
            r"proxy.*unexpected response code: 503",
            ANY,
        ),
        m(
            Kind::new("INET_DEFAULT_ROUTE", INTERNET_NOT_FOUND)
                .advice("Configure a default route on this Linux host, or use another --driver that does not require it")
                .issues(&[6083, 5636]),
            r"(No|from) default routes",
            LINUX,
        ),
    ]
}

fn guest_issues() -> Vec<Match> {
    vec![
        m(
            Kind::new("GUEST_KVM2_NO_DOMAIN", GUEST_NOT_FOUND)
                .advice(VM_GONE)
                .issues(&[3636]),
            r"no domain with matching name",
            LINUX,
        ),
        m(
            Kind::new("GUEST_PORT_IN_USE", GUEST_CONFLICT)
                .advice("kubeadm detected a TCP port conflict with another process: probably another local Kubernetes installation. Run lsof -p<port> to find the process and kill it")
                .issues(&[5484]),
            r"ERROR Port-.*is in use",
            LINUX,
        ),
        m(
            Kind::new("GUEST_DOES_NOT_EXIST", GUEST_NOT_FOUND)
                .advice("Run 'minikube delete' to delete the stale VM, or and ensure that minikube is running as the same user you are issuing this command with")
                .issues(&[3864, 6087]),
            r"machine does not exist",
            ANY,
        ),
        m(
            Kind::new("GUEST_NOT_FOUND", GUEST_NOT_FOUND)
                .advice("Your minikube vm is not running, try minikube start.")
                .issues(&[4889]),
            r"Machine does not exist for api.Exists",
            ANY,
        ),
        m(
            Kind::new("GUEST_IP_NOT_FOUND", GUEST_NOT_RUNNING)
                .advice("The minikube VM is offline. Please run 'minikube start' to start it again.")
                .issues(&[3849, 3648]),
            r"Error getting ssh host name for driver: IP not found",
            ANY,
        ),
        m(
            Kind::new("GUEST_UNSIGNED_CERT", GUEST_CONFIG)
                .advice("Try 'minikube delete' to force new SSL certificates to be installed")
                .issues(&[6596]),
            r"not signed by CA certificate ca: crypto/rsa: verification error",
            ANY,
        ),
        m(
            Kind::new("GUEST_VBOX_NO_VM", GUEST_NOT_FOUND)
                .advice(VM_GONE)
                .issues(&[4694]),
            r"Could not find a registered machine named",
            ANY,
        ),
        m(
            Kind::new("GUEST_FILE_IN_USE", GUEST_CONFLICT)
                .advice("Another program is using a file required by minikube. If you are using Hyper-V, try stopping the minikube VM from within the Hyper-V manager")
                .url(HYPERV_DOC)
                .issues(&[7300]),
            r"The process cannot access the file because it is being used by another process",
            WINDOWS,
        ),
        m(
            Kind::new("GUEST_NOT_FOUND", GUEST_NOT_FOUND)
                .advice(GUEST_FILES_MISSING)
                .issues(&[9130]),
            r"config.json: The system cannot find the file specified",
            ANY,
        ),
        m(
            Kind::new("GUEST_SSH_CERT_NOT_FOUND", GUEST_NOT_FOUND)
                .advice(GUEST_FILES_MISSING)
                .issues(&[9130]),
            r"id_rsa: no such file or directory",
            ANY,
        ),
        m(
            Kind::new("GUEST_CONFIG_CORRUPT", GUEST_CONFIG)
                .advice("The existing node configuration appears to be corrupt. Run 'minikube delete'")
                .issues(&[9175]),
            r"configuration.*corrupt",
            ANY,
        ),
    ]
}

fn runtime_issues() -> Vec<Match> {
    vec![
        m(
            Kind::new("RT_DOCKER_RESTART", RUNTIME_ERROR)
                .advice("Remove the invalid --docker-opt or --insecure-registry flag if one was provided")
                .issues(&[7070]),
            r"systemctl -f restart docker",
            ANY,
        ),
        m(
            Kind::new("RT_DOCKER_UNAVAILABLE", RUNTIME_UNAVAILABLE)
                .advice("Docker inside the VM is unavailable. Try running 'minikube delete' to reset the VM.")
                .issues(&[3952]),
            r"Error configuring auth on host: OS type not recognized",
            ANY,
        ),
        m(
            Kind::new("RT_DOCKER_EXIT_1", RUNTIME_NOT_FOUND)
                .advice("Either systemctl is not installed, or Docker is broken. Run 'sudo systemctl start docker' and 'journalctl -u docker'")
                .url(NONE_DRIVER_DOC)
                .issues(&[2704, 4498]),
            r"sudo systemctl start docker: exit status 1",
            LINUX,
        ),
        m(
            Kind::new("RT_DOCKER_EXIT_5", RUNTIME_UNAVAILABLE)
                .advice("Ensure that Docker is installed and healthy: Run 'sudo systemctl start docker' and 'journalctl -u docker'. Alternatively, select another value for --driver")
                .url(NONE_DRIVER_DOC)
                .issues(&[5532]),
            r"sudo systemctl start docker: exit status 5",
            LINUX,
        ),
        m(
            Kind::new("RT_CRIO_EXIT_5", RUNTIME_UNAVAILABLE)
                .advice("Ensure that CRI-O is installed and healthy: Run 'sudo systemctl start crio' and 'journalctl -u crio'. Alternatively, use --container-runtime=docker")
                .url(NONE_DRIVER_DOC)
                .issues(&[5532]),
            r"sudo systemctl restart crio: exit status 5",
            LINUX,
        ),
    ]
}

fn control_plane_issues() -> Vec<Match> {
    vec![
        m(
            Kind::new("K8S_APISERVER_MISSING", CONTROL_PLANE_NOT_FOUND)
                .advice("Check that the provided apiserver flags are valid, and that SELinux is disabled")
                .issues(&[4536, 6014]),
            r"apiserver process never appeared",
            ANY,
        ),
        m(
            Kind::new("K8S_APISERVER_TIMEOUT", CONTROL_PLANE_TIMEOUT)
                .advice("A VPN or firewall is interfering with HTTP access to the minikube VM. Alternatively, try a different VM driver: https://minikube.sigs.k8s.io/docs/start/")
                .url(VPN_DOC)
                .issues(&[4302]),
            r"apiserver: timed out waiting for the condition",
            ANY,
        ),
        m(
            Kind::new("K8S_DNS_TIMEOUT", CONTROL_PLANE_TIMEOUT)
                .advice("Run 'kubectl describe pod coredns -n kube-system' and check for a firewall or DNS conflict")
                .url(VPN_DOC),
            r"dns: timed out waiting for the condition",
            ANY,
        ),
        m(
            Kind::new("K8S_KUBELET_NOT_RUNNING", CONTROL_PLANE_UNAVAILABLE)
                .advice("Check output of 'journalctl -xeu kubelet', try passing --extra-config=kubelet.cgroup-driver=systemd to minikube start")
                .issues(&[4172]),
            r"The kubelet is not running|kubelet isn't running",
            LINUX,
        ),
        m(
            Kind::new("K8S_INVALID_DNS_DOMAIN", CONTROL_PLANE_CONFIG)
                .advice("Select a valid value for --dnsdomain"),
            r"dnsDomain: Invalid",
            ANY,
        ),
        m(
            Kind::new("K8S_INVALID_CERT_HOSTNAME", CONTROL_PLANE_CONFIG)
                .advice("The certificate hostname provided appears to be invalid (may be a minikube bug)")
                .new_issue_link(),
            r"apiServer.certSANs: Invalid value",
            ANY,
        ),
    ]
}

fn service_issues() -> Vec<Match> {
    vec![
        m(
            Kind::new("SVC_ENDPOINT_NOT_FOUND", SERVICE_NOT_FOUND)
                .advice("Please make sure the service you are looking for is deployed or is in the correct namespace.")
                .issues(&[4599]),
            r"Could not find finalized endpoint being pointed to by",
            ANY,
        ),
        m(
            Kind::new("SVC_OPEN_NOT_FOUND", SERVICE_NOT_FOUND)
                .advice("Use 'kubectl get po -A' to find the correct and namespace name")
                .issues(&[5836]),
            r"Error opening service.*not found",
            ANY,
        ),
        m(
            Kind::new("SVC_DASHBOARD_ROLE_REF", SERVICE_PERMISSION)
                .advice("Run: 'kubectl delete clusterrolebinding kubernetes-dashboard'")
                .issues(&[7256]),
            r"dashboard.*cannot change roleRef",
            ANY,
        ),
    ]
}

/// The operating system name used in known-issue allow-lists.
pub fn host_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

/// Matches an error message against the catalog.
///
/// Returns `None` when `requested` insists on its own classification or no
/// entry matches. An entry specific to `os` wins over entries that are not;
/// otherwise the first matching entry is returned.
pub fn match_known_issue(requested: &Kind, msg: &str, os: &str) -> Option<Kind> {
    if requested.no_match {
        return None;
    }
    let mut generic: Option<&Match> = None;
    for candidate in KNOWN_ISSUES.iter() {
        if !candidate.regex.is_match(msg) {
            continue;
        }
        if !candidate.goos.is_empty() && candidate.goos.contains(&os) {
            return Some(candidate.kind.clone());
        }
        if generic.is_none() {
            generic = Some(candidate);
        }
    }
    generic.map(|m| m.kind.clone())
}

#[cfg(test)]
mod test {
    use super::*;

    fn cases() -> Vec<(u32, &'static str, &'static str, &'static str)> {
        vec![
            (2991, "linux", "PR_KVM_CAPABILITIES", "Unable to start VM: create: Error creating machine: Error in driver during machine creation: creating domain: Error defining domain xml:\n\n: virError(Code=8, Domain=44, Message='invalid argument: could not find capabilities for domaintype=kvm ')"),
            (3594, "", "IF_HOST_CIDR_CONFLICT", "Error starting host: Error starting stopped host: Error setting up host only network on machine start: host-only cidr conflicts with the network address of a host interface."),
            (3614, "", "IF_VBOX_NOT_VISIBLE", "Error starting host:  Error starting stopped host: Error setting up host only network on machine start: The host-only adapter we just created is not visible. This is a well known VirtualBox bug. You might want to uninstall it and reinstall at least version 5.0.12 that is supposed to fix this issue"),
            (3784, "", "PR_VBOXMANAGE_NOT_FOUND", "create: precreate: VBoxManage not found. Make sure VirtualBox is installed and VBoxManage is in the path"),
            (3849, "", "GUEST_IP_NOT_FOUND", "bootstrapper: Error creating new ssh host from driver: Error getting ssh host name for driver: IP not found"),
            (3859, "windows", "PR_VBOX_HARDENING", "Unable to start VM: create: creating: Unable to start the VM: C:\\Program Files\\Oracle\\VirtualBox\\VBoxManage.exe startvm minikube --type headless failed:\nVBoxManage.exe: error: The virtual machine 'minikube' has terminated unexpectedly during startup with exit code -1073741819 (0xc0000005). More details may be available in 'C:\\Users\\pabitra_b.minikube\\machines\\minikube\\minikube\\Logs\\VBoxHardening.log'"),
            (4107, "darwin", "PR_VBOX_BLOCKED", "Result Code: NS_ERROR (0x80004005)"),
            (4302, "", "K8S_APISERVER_TIMEOUT", "apiserver: timed out waiting for the condition"),
            (4252, "", "INET_TLS_OVERSIZED", "Failed to update cluster: downloading binaries: downloading kubeadm: Error downloading kubeadm v1.14.1: failed to download: failed to download to temp file: download failed: 5 error(s) occurred:\n\nTemporary download error: Get https://storage.googleapis.com/kubernetes-release/release/v1.14.1/bin/linux/amd64/kubeadm: proxyconnect tcp: tls: oversized record received with length 20527"),
            (6014, "linux", "K8S_APISERVER_MISSING", "Error restarting cluster: waiting for apiserver: apiserver process never appeared"),
            (5836, "", "SVC_OPEN_NOT_FOUND", "Error opening service: Service newservice was not found in \"unknown\" namespace. You may select another namespace by using 'minikube service newservice -n : Temporary Error: Error getting service newservice: services \"newservice\" not found"),
            (6087, "", "GUEST_DOES_NOT_EXIST", "Error getting machine status: state: machine does not exist"),
            (5714, "darwin", "HOST_KUBECONFIG_PERMISSION", "Failed to setup kubeconfig: writing kubeconfig: Error writing file /Users/foo/.kube/config: error writing file /Users/foo/.kube/config: open /Users/foo/.kube/config: permission denied"),
            (5532, "linux", "RT_DOCKER_EXIT_5", "Failed to enable container runtime: running command: sudo systemctl start docker: exit status 5"),
            (5532, "linux", "RT_CRIO_EXIT_5", "Failed to enable container runtime: running command: sudo systemctl restart crio: exit status 5"),
            (5484, "linux", "GUEST_PORT_IN_USE", "[ERROR Port-10252]: Port 10252 is in use"),
            (4913, "linux", "PR_KVM_CREATE_BUSY", "Unable to start VM: create: Error creating machine: Error in driver during machine creation: error creating VM: virError(Code=1, Domain=10, Message='internal error: process exited while connecting to monitor: ioctl(KVM_CREATE_VM) failed: 16 Device or resource busy"),
            (3898, "", "INET_PULL_TIMEOUT", "[ERROR ImagePull]: failed to pull image k8s.gcr.io/kube-controller-manager:v1.17.0: output: Error response from daemon: Get https://k8s.gcr.io/v2/: net/http: request canceled while waiting for connection (Client.Timeout exceeded while awaiting headers)"),
            (6079, "darwin", "PR_HYPERKIT_CRASHED", "Error creating machine: Error in driver during machine creation: hyperkit crashed! command line:"),
            (5636, "linux", "INET_DEFAULT_ROUTE", "Unable to get VM IP address: unable to select an IP from default routes."),
            (6098, "windows", "PR_PRECREATE_EXIT_1", "Retriable failure: create: precreate: exit status 1"),
            (6107, "", "INET_PROXY_CONFUSION", "http: server gave HTTP response to HTTPS client"),
            (6109, "", "INET_DOWNLOAD_BLOCKED", "Failed to update cluster: downloading binaries: downloading kubelet: Error downloading kubelet v1.16.2: failed to download: failed to download to temp file: failed to copy contents: read tcp 192.168.0.106:61314->172.217.166.176:443: wsarecv: A connection attempt failed because the connected party did not properly respond after a period of time, or established connection failed because connected host has failed to respond."),
            (4277, "linux", "PR_KVM_MSR", "Unable to start VM: start: Error creating VM: virError(Code=1, Domain=10, Message='internal error: qemu unexpectedly closed the monitor: 2019-05-17T02:20:07.980140Z qemu-system-x86_64: error: failed to set MSR 0x38d to 0x0"),
            (8832, "macos", "PR_DOCKER_MOUNTS_EOF", "docker: Error response from daemon: Mounts denied: EOF."),
            (9165, "", "HOST_HOME_PERMISSION", "open /Users/foo/.minikube/profiles/gcloud-local-dev/config.json: permission denied"),
            (9175, "", "GUEST_CONFIG_CORRUPT", " updating control plane: generating kubeadm cfg: generating extra component config for kubeadm: controlPlane configuration is corrupt: no name: {Name: IP: Port:8443 KubernetesVersion:v1.19.0 ControlPlane:true Worker:true}"),
        ]
    }

    #[test]
    fn known_error_messages_are_classified() {
        let none = Kind::new("", 0);
        for (issue, os, want, msg) in cases() {
            let got = match_known_issue(&none, msg, os)
                .unwrap_or_else(|| panic!("{:?} did not match, want {}", msg, want));
            assert_eq!(got.id, want, "classifying {:?}", msg);
            assert!(
                got.issues.contains(&issue),
                "issue {} is not listed for {}",
                issue,
                got.id
            );
        }
    }

    #[test]
    fn unknown_errors_do_not_match() {
        let none = Kind::new("", 0);
        assert!(match_known_issue(
            &none,
            "this is just a lame error message with no matches.",
            ""
        )
        .is_none());
    }

    #[test]
    fn os_specific_entry_wins_over_generic() {
        let none = Kind::new("", 0);
        let windows = match_known_issue(&none, "docker: Mounts denied: EOF", "windows")
            .expect("should match");
        assert_eq!(windows.url, "https://docs.docker.com/docker-for-windows/#reset");
        let darwin = match_known_issue(&none, "docker: Mounts denied: EOF", "darwin")
            .expect("should match");
        assert_eq!(darwin.url, "https://docs.docker.com/docker-for-mac/#reset");
    }

    #[test]
    fn rt_docker_exit_5_on_linux() {
        let none = Kind::new("", 0);
        let kind = match_known_issue(&none, "sudo systemctl start docker: exit status 5", "linux")
            .expect("should match");
        assert_eq!(kind.id, "RT_DOCKER_EXIT_5");
        assert_eq!(kind.exit_code, 99);
    }

    #[test]
    fn no_match_is_honored() {
        let requested = Kind::new("GUEST_START", GUEST_ERROR).no_match();
        assert!(
            match_known_issue(&requested, "machine does not exist", "linux").is_none()
        );
    }
}
