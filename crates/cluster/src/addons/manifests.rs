//! Manifest templates for the bundled addons.
//!
//! `{{.Key}}` tokens are replaced from the cluster config and
//! `{{.Images.Name}}` tokens by the resolved image of the addon.

pub const STORAGE_PROVISIONER: &str = r#"apiVersion: v1
kind: ServiceAccount
metadata:
  name: storage-provisioner
  namespace: kube-system
  labels:
    addonmanager.kubernetes.io/mode: Reconcile
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: storage-provisioner
  labels:
    addonmanager.kubernetes.io/mode: EnsureExists
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: system:persistent-volume-provisioner
subjects:
  - kind: ServiceAccount
    name: storage-provisioner
    namespace: kube-system
---
apiVersion: v1
kind: Pod
metadata:
  name: storage-provisioner
  namespace: kube-system
  labels:
    integration-test: storage-provisioner
    addonmanager.kubernetes.io/mode: Reconcile
spec:
  serviceAccountName: storage-provisioner
  hostNetwork: true
  containers:
  - name: storage-provisioner
    image: {{.Images.StorageProvisioner}}
    command: ["/storage-provisioner"]
    imagePullPolicy: IfNotPresent
    volumeMounts:
    - mountPath: /tmp
      name: tmp
  volumes:
  - name: tmp
    hostPath:
      path: /tmp
      type: Directory
"#;

pub const DEFAULT_STORAGECLASS: &str = r#"apiVersion: storage.k8s.io/v1
kind: StorageClass
metadata:
  namespace: kube-system
  name: standard
  annotations:
    storageclass.kubernetes.io/is-default-class: "true"
  labels:
    addonmanager.kubernetes.io/mode: EnsureExists
provisioner: k8s.io/minikube-hostpath
"#;

pub const DASHBOARD: &str = r#"apiVersion: v1
kind: Namespace
metadata:
  name: kubernetes-dashboard
  labels:
    addonmanager.kubernetes.io/mode: Reconcile
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: kubernetes-dashboard
  namespace: kubernetes-dashboard
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: kubernetes-dashboard
  namespace: kubernetes-dashboard
  labels:
    k8s-app: kubernetes-dashboard
spec:
  replicas: 1
  selector:
    matchLabels:
      k8s-app: kubernetes-dashboard
  template:
    metadata:
      labels:
        k8s-app: kubernetes-dashboard
    spec:
      serviceAccountName: kubernetes-dashboard
      containers:
      - name: kubernetes-dashboard
        image: {{.Images.Dashboard}}
        args:
        - --namespace=kubernetes-dashboard
        - --enable-skip-login
        - --disable-settings-authorizer
        ports:
        - containerPort: 9090
      - name: dashboard-metrics-scraper
        image: {{.Images.MetricsScraper}}
        ports:
        - containerPort: 8000
---
apiVersion: v1
kind: Service
metadata:
  name: kubernetes-dashboard
  namespace: kubernetes-dashboard
  labels:
    k8s-app: kubernetes-dashboard
spec:
  ports:
  - port: 80
    targetPort: 9090
  selector:
    k8s-app: kubernetes-dashboard
"#;

pub const METRICS_SERVER: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: metrics-server
  namespace: kube-system
  labels:
    k8s-app: metrics-server
spec:
  selector:
    matchLabels:
      k8s-app: metrics-server
  template:
    metadata:
      name: metrics-server
      labels:
        k8s-app: metrics-server
    spec:
      serviceAccountName: metrics-server
      containers:
      - name: metrics-server
        image: {{.Images.MetricsServer}}
        args:
        - --cert-dir=/tmp
        - --secure-port=4443
        - --kubelet-insecure-tls
        - --kubelet-preferred-address-types=InternalIP
        - --metric-resolution=60s
        ports:
        - name: https
          containerPort: 4443
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: metrics-server
  namespace: kube-system
---
apiVersion: v1
kind: Service
metadata:
  name: metrics-server
  namespace: kube-system
  labels:
    kubernetes.io/name: "Metrics-server"
spec:
  selector:
    k8s-app: metrics-server
  ports:
  - name: https
    port: 443
    targetPort: https
---
apiVersion: apiregistration.k8s.io/v1
kind: APIService
metadata:
  name: v1beta1.metrics.k8s.io
spec:
  service:
    name: metrics-server
    namespace: kube-system
  group: metrics.k8s.io
  version: v1beta1
  insecureSkipTLSVerify: true
  groupPriorityMinimum: 100
  versionPriority: 100
"#;

pub const INGRESS: &str = r#"apiVersion: v1
kind: Namespace
metadata:
  name: ingress-nginx
  labels:
    app.kubernetes.io/name: ingress-nginx
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: ingress-nginx-controller
  namespace: ingress-nginx
  labels:
    app.kubernetes.io/name: ingress-nginx
    app.kubernetes.io/component: controller
spec:
  selector:
    matchLabels:
      app.kubernetes.io/name: ingress-nginx
      app.kubernetes.io/component: controller
  template:
    metadata:
      labels:
        app.kubernetes.io/name: ingress-nginx
        app.kubernetes.io/component: controller
        gcp-auth-skip-secret: "true"
    spec:
      serviceAccountName: ingress-nginx
      containers:
      - name: controller
        image: {{.Images.IngressController}}
        args:
        - /nginx-ingress-controller
        - --election-id=ingress-nginx-leader
        - --controller-class=k8s.io/ingress-nginx
        - --watch-ingress-without-class=true
        - --publish-status-address=localhost
        - --default-ssl-certificate={{.CustomIngressCert}}
        ports:
        - name: http
          containerPort: 80
          hostPort: 80
        - name: https
          containerPort: 443
          hostPort: 443
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: ingress-nginx
  namespace: ingress-nginx
---
apiVersion: networking.k8s.io/v1
kind: IngressClass
metadata:
  name: nginx
  annotations:
    ingressclass.kubernetes.io/is-default-class: "true"
spec:
  controller: k8s.io/ingress-nginx
"#;

pub const INGRESS_DNS: &str = r#"apiVersion: v1
kind: Pod
metadata:
  name: kube-ingress-dns-minikube
  namespace: kube-system
  labels:
    app: minikube-ingress-dns
    app.kubernetes.io/part-of: kube-system
spec:
  hostNetwork: true
  containers:
  - name: minikube-ingress-dns
    image: {{.Images.IngressDNS}}
    ports:
    - containerPort: 53
      protocol: UDP
    env:
    - name: DNS_PORT
      value: "53"
    - name: POD_IP
      valueFrom:
        fieldRef:
          fieldPath: status.podIP
"#;

pub const REGISTRY: &str = r#"apiVersion: v1
kind: ReplicationController
metadata:
  name: registry
  namespace: kube-system
  labels:
    kubernetes.io/minikube-addons: registry
spec:
  replicas: 1
  selector:
    kubernetes.io/minikube-addons: registry
  template:
    metadata:
      labels:
        actual-registry: "true"
        kubernetes.io/minikube-addons: registry
    spec:
      containers:
      - name: registry
        image: {{.Images.Registry}}
        ports:
        - containerPort: 5000
          protocol: TCP
        env:
        - name: REGISTRY_STORAGE_DELETE_ENABLED
          value: "true"
---
apiVersion: v1
kind: Service
metadata:
  name: registry
  namespace: kube-system
  labels:
    kubernetes.io/minikube-addons: registry
spec:
  type: ClusterIP
  ports:
  - name: http
    port: 80
    targetPort: 5000
  selector:
    actual-registry: "true"
    kubernetes.io/minikube-addons: registry
"#;

pub const REGISTRY_CREDS: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: registry-creds
  namespace: kube-system
  labels:
    kubernetes.io/minikube-addons: registry-creds
spec:
  replicas: 1
  selector:
    matchLabels:
      name: registry-creds
  template:
    metadata:
      labels:
        name: registry-creds
    spec:
      containers:
      - name: registry-creds
        image: {{.Images.RegistryCreds}}
        env:
        - name: AWS_ACCESS_KEY_ID
          valueFrom:
            secretKeyRef:
              name: registry-creds-ecr
              key: AWS_ACCESS_KEY_ID
              optional: true
        - name: AWS_SECRET_ACCESS_KEY
          valueFrom:
            secretKeyRef:
              name: registry-creds-ecr
              key: AWS_SECRET_ACCESS_KEY
              optional: true
        - name: DOCKER_PRIVATE_REGISTRY_SERVER
          valueFrom:
            secretKeyRef:
              name: registry-creds-dpr
              key: DOCKER_PRIVATE_REGISTRY_SERVER
              optional: true
        - name: DOCKER_PRIVATE_REGISTRY_USER
          valueFrom:
            secretKeyRef:
              name: registry-creds-dpr
              key: DOCKER_PRIVATE_REGISTRY_USER
              optional: true
        - name: DOCKER_PRIVATE_REGISTRY_PASSWORD
          valueFrom:
            secretKeyRef:
              name: registry-creds-dpr
              key: DOCKER_PRIVATE_REGISTRY_PASSWORD
              optional: true
        - name: ACR_URL
          valueFrom:
            secretKeyRef:
              name: registry-creds-acr
              key: ACR_URL
              optional: true
        volumeMounts:
        - name: gcr-creds
          mountPath: "/root/.config/gcloud"
          readOnly: true
      volumes:
      - name: gcr-creds
        secret:
          secretName: registry-creds-gcr
          optional: true
"#;

pub const REGISTRY_ALIASES: &str = r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: registry-aliases
  namespace: kube-system
  labels:
    kubernetes.io/minikube-addons: registry-aliases
data:
  registryAliases: >-
    {{.RegistryAliases}}
  registrySvc: registry.kube-system.svc.cluster.local
---
apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: registry-aliases-hosts-update
  namespace: kube-system
  labels:
    kubernetes.io/minikube-addons: registry-aliases
spec:
  selector:
    matchLabels:
      app: registry-aliases-hosts-update
  template:
    metadata:
      labels:
        app: registry-aliases-hosts-update
    spec:
      initContainers:
      - name: update
        image: {{.Images.Alpine}}
        volumeMounts:
        - name: etchosts
          mountPath: /host-etc/hosts
          readOnly: false
        env:
        - name: REGISTRY_ALIASES
          valueFrom:
            configMapKeyRef:
              name: registry-aliases
              key: registryAliases
        command: ["/bin/sh", "-c"]
        args:
        - |
          REGISTRY_SERVICE_HOST=$(getent hosts registry.kube-system.svc.cluster.local | awk '{print $1}')
          for H in $REGISTRY_ALIASES; do
            grep -q "$H" /host-etc/hosts || echo "$REGISTRY_SERVICE_HOST $H" >> /host-etc/hosts
          done
      containers:
      - name: pause-for-update
        image: {{.Images.Pause}}
      volumes:
      - name: etchosts
        hostPath:
          path: /etc/hosts
"#;

pub const METALLB: &str = r#"apiVersion: v1
kind: Namespace
metadata:
  name: metallb-system
  labels:
    app: metallb
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: controller
  namespace: metallb-system
  labels:
    app: metallb
    component: controller
spec:
  selector:
    matchLabels:
      app: metallb
      component: controller
  template:
    metadata:
      labels:
        app: metallb
        component: controller
    spec:
      containers:
      - name: controller
        image: {{.Images.Controller}}
        args:
        - --port=7472
        - --config=config
---
apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: speaker
  namespace: metallb-system
  labels:
    app: metallb
    component: speaker
spec:
  selector:
    matchLabels:
      app: metallb
      component: speaker
  template:
    metadata:
      labels:
        app: metallb
        component: speaker
    spec:
      hostNetwork: true
      containers:
      - name: speaker
        image: {{.Images.Speaker}}
        args:
        - --port=7472
        - --config=config
---
apiVersion: v1
kind: ConfigMap
metadata:
  namespace: metallb-system
  name: config
data:
  config: |
    address-pools:
    - name: default
      protocol: layer2
      addresses:
      - {{.LoadBalancerStartIP}}-{{.LoadBalancerEndIP}}
"#;

pub const AUTO_PAUSE_UNIT: &str = r#"[Unit]
Description=Auto Pause Service

[Service]
Type=simple
ExecStart=/bin/auto-pause --container-runtime={{.ContainerRuntime}} --interval={{.AutoPauseInterval}}
Restart=always

[Install]
WantedBy=multi-user.target
"#;

pub const AUTO_PAUSE_HOOK: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: auto-pause-proxy
  namespace: auto-pause
  labels:
    app: auto-pause-proxy
spec:
  replicas: 1
  selector:
    matchLabels:
      app: auto-pause-proxy
  template:
    metadata:
      labels:
        app: auto-pause-proxy
    spec:
      hostNetwork: true
      containers:
      - name: auto-pause
        image: {{.Images.AutoPauseHook}}
        args:
        - --tls-cert-file=/var/lib/minikube/certs/apiserver.crt
        - --tls-key-file=/var/lib/minikube/certs/apiserver.key
        volumeMounts:
        - name: certs
          mountPath: /var/lib/minikube/certs
          readOnly: true
      volumes:
      - name: certs
        hostPath:
          path: /var/lib/minikube/certs
---
apiVersion: v1
kind: Namespace
metadata:
  name: auto-pause
"#;

pub const CSI_HOSTPATH_DRIVER: &str = r#"apiVersion: storage.k8s.io/v1
kind: CSIDriver
metadata:
  name: hostpath.csi.k8s.io
  labels:
    app.kubernetes.io/part-of: csi-driver-host-path
spec:
  attachRequired: true
  podInfoOnMount: true
  volumeLifecycleModes:
  - Persistent
  - Ephemeral
---
apiVersion: apps/v1
kind: StatefulSet
metadata:
  name: csi-hostpathplugin
  namespace: kube-system
  labels:
    app.kubernetes.io/name: csi-hostpathplugin
spec:
  serviceName: csi-hostpathplugin
  replicas: 1
  selector:
    matchLabels:
      app.kubernetes.io/name: csi-hostpathplugin
  template:
    metadata:
      labels:
        app.kubernetes.io/name: csi-hostpathplugin
    spec:
      containers:
      - name: hostpath
        image: {{.Images.HostPathPlugin}}
        args:
        - --drivername=hostpath.csi.k8s.io
        - --endpoint=unix:///csi/csi.sock
        - --nodeid=$(KUBE_NODE_NAME)
        securityContext:
          privileged: true
      - name: csi-provisioner
        image: {{.Images.Provisioner}}
        args:
        - --csi-address=/csi/csi.sock
      - name: csi-snapshotter
        image: {{.Images.Snapshotter}}
        args:
        - --csi-address=/csi/csi.sock
---
apiVersion: storage.k8s.io/v1
kind: StorageClass
metadata:
  name: csi-hostpath-sc
provisioner: hostpath.csi.k8s.io
reclaimPolicy: Delete
volumeBindingMode: Immediate
"#;

pub const VOLUMESNAPSHOTS: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: snapshot-controller
  namespace: kube-system
spec:
  replicas: 1
  selector:
    matchLabels:
      app: snapshot-controller
  template:
    metadata:
      labels:
        app: snapshot-controller
    spec:
      serviceAccountName: volume-snapshot-controller
      containers:
      - name: volume-snapshot-controller
        image: {{.Images.SnapshotController}}
        args:
        - --v=5
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: volume-snapshot-controller
  namespace: kube-system
"#;

pub const GCP_AUTH: &str = r#"apiVersion: v1
kind: Namespace
metadata:
  name: gcp-auth
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: gcp-auth
  namespace: gcp-auth
spec:
  selector:
    matchLabels:
      app: gcp-auth
  template:
    metadata:
      labels:
        app: gcp-auth
        kubernetes.io/minikube-addons: gcp-auth
    spec:
      containers:
      - name: gcp-auth
        image: {{.Images.GCPAuthWebhook}}
        ports:
        - containerPort: 8443
        env:
        - name: GOOGLE_APPLICATION_CREDENTIALS
          value: /google-app-creds.json
        volumeMounts:
        - name: gcp-project
          mountPath: /var/lib/minikube/google_cloud_project
          readOnly: true
      volumes:
      - name: gcp-project
        hostPath:
          path: /var/lib/minikube/google_cloud_project
          type: File
---
apiVersion: v1
kind: Service
metadata:
  name: gcp-auth
  namespace: gcp-auth
spec:
  ports:
  - name: webhook
    port: 443
    targetPort: 8443
  selector:
    app: gcp-auth
"#;
